use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    Form, Json, Router,
    extract::State,
    http::{Method, Uri},
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

/// One request observed by the mock sign service.
#[derive(Debug, Clone)]
pub struct SignCall {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
}

#[derive(Clone, Default)]
struct SignState {
    calls: Arc<Mutex<Vec<SignCall>>>,
    registered: Arc<Mutex<bool>>,
}

/// Canned sign service answering every route the delegate uses.
pub struct SignServer {
    pub addr: String,
    state: SignState,
    task: JoinHandle<()>,
}

impl SignServer {
    pub fn calls(&self) -> Vec<SignCall> {
        self.state.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn calls_to(&self, path: &str) -> Vec<SignCall> {
        self.calls().into_iter().filter(|call| call.path == path).collect()
    }
}

impl Drop for SignServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_sign_server() -> anyhow::Result<SignServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = SignState::default();

    let app = Router::new().fallback(handle).with_state(state.clone());
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(SignServer {
        addr: addr.to_string(),
        state,
        task,
    })
}

async fn handle(
    State(state): State<SignState>,
    method: Method,
    uri: Uri,
    Form(params): Form<HashMap<String, String>>,
) -> Json<Value> {
    let path = uri.path().to_owned();
    if let Ok(mut calls) = state.calls.lock() {
        calls.push(SignCall {
            method,
            path: path.clone(),
            params,
        });
    }
    let registered = state.registered.lock().map(|flag| *flag).unwrap_or(false);

    Json(match path.as_str() {
        "/sign" => json!({
            "code": 0,
            "data": {
                "sign": "0a0b",
                "token": "0c",
                "extra": "0d",
                "ssoPacketList": [{ "cmd": "trpc.o3.report", "body": "0801", "callbackId": 7 }],
            },
        }),
        "/energy" => json!({ "code": 0, "data": "deadbeef" }),
        "/request_token" if !registered => json!({ "code": 1, "msg": "uin not registered" }),
        "/request_token" => json!({
            "code": 0,
            "data": [{ "cmd": "trpc.o3.token", "body": "", "callback_id": "-1" }],
        }),
        "/register" => {
            if let Ok(mut flag) = state.registered.lock() {
                *flag = true;
            }
            json!({ "code": 0, "msg": "ok" })
        }
        "/submit" => json!({ "code": 0, "data": [] }),
        "/ver" => json!({ "code": 0, "data": { "com.tencent.mobileqq": ["9.9.9", "8.9.80", "8.9.63"] } }),
        "/" => json!({ "code": 0, "data": { "protocol": { "version": "8.9.63" } } }),
        _ => json!({ "code": 404, "msg": "unknown route" }),
    })
}
