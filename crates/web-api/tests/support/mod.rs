#![allow(dead_code)]

use std::time::Duration;

use config::AppConfig;
use futures_util::{SinkExt, StreamExt};
use infrastructure::Infrastructure;
use reqwest::{header::SET_COOKIE, Client, StatusCode};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message as TungsteniteMessage},
    MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database.in_memory = true;
    config.security.bcrypt_cost = Some(4);
    config.jwt.secret = "integration-test-secret-0123456789".to_string();
    config
}

/// 内存存储上的真实 HTTP/WebSocket 服务，drop 时关闭。
pub struct TestServer {
    pub base_http: String,
    pub base_ws: String,
    pub client: Client,
    shutdown: Option<oneshot::Sender<()>>,
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: String,
    pub email: String,
    pub cookie: String,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(test_config()).await
}

/// 心跳较短的配置，用于存活超时测试。
pub fn fast_heartbeat_config() -> AppConfig {
    let mut config = test_config();
    config.realtime.ping_interval_secs = 1;
    config.realtime.liveness_timeout_secs = 2;
    config
}

pub async fn spawn_server_with(config: AppConfig) -> TestServer {
    let infrastructure = Infrastructure::in_memory(&config);
    let app = router(AppState::new(&config, infrastructure));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    TestServer {
        base_http: format!("http://{}", addr),
        base_ws: format!("ws://{}/ws", addr),
        client: Client::new(),
        shutdown: Some(shutdown_tx),
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_http, path)
    }

    pub async fn register(&self, email: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/register"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .expect("register request")
    }

    pub async fn login(&self, email: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/api/auth/login"))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .expect("login request")
    }

    /// 注册并登录，返回可直接放进 `Cookie` 头的认证 cookie。
    pub async fn signup(&self, local: &str) -> TestUser {
        let email = format!("{}@example.com", local);
        let registered = self.register(&email, "secret-pass").await;
        assert_eq!(registered.status(), StatusCode::CREATED);
        let body: Value = registered.json().await.expect("register json");
        let id = body["user"]["id"].as_str().expect("user id").to_string();

        let logged_in = self.login(&email, "secret-pass").await;
        assert_eq!(logged_in.status(), StatusCode::OK);
        let cookie = auth_cookie(&logged_in).expect("auth cookie");

        TestUser { id, email, cookie }
    }

    pub async fn get_json(&self, path: &str, user: &TestUser) -> (StatusCode, Value) {
        let response = self
            .client
            .get(self.url(path))
            .header("Cookie", &user.cookie)
            .send()
            .await
            .expect("get request");
        let status = response.status();
        let body = response.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn connect(&self, user: &TestUser) -> WsClient {
        let mut request = self.base_ws.as_str().into_client_request().expect("ws request");
        request.headers_mut().insert(
            "Cookie",
            HeaderValue::from_str(&user.cookie).expect("cookie header"),
        );
        let (stream, _) = connect_async(request).await.expect("ws connect");
        WsClient { stream }
    }
}

/// 从 `Set-Cookie` 中取出 `auth-token=…` 键值对。
pub fn auth_cookie(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with("auth-token="))
        .and_then(|value| value.split(';').next())
        .map(str::to_string)
}

pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn send(&mut self, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, frame: &str) {
        self.stream
            .send(TungsteniteMessage::Text(frame.to_string().into()))
            .await
            .expect("ws send");
    }

    /// 下一个文本事件，忽略控制帧。
    pub async fn next_event(&mut self) -> Value {
        loop {
            let frame = timeout(EVENT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("ws error");
            if let TungsteniteMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("event json");
            }
        }
    }

    /// 跳过其它事件直到收到指定事件，返回其 `data`。
    pub async fn expect_event(&mut self, name: &str) -> Value {
        loop {
            let event = self.next_event().await;
            if event["event"] == name {
                return event["data"].clone();
            }
        }
    }

    /// 等待指定用户的在线状态事件。
    pub async fn expect_presence(&mut self, user_id: &str, online: bool) {
        loop {
            let data = self.expect_event("user_connection").await;
            if data["userId"] == user_id && data["isOnline"] == online {
                return;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
