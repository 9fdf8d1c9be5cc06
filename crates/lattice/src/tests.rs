//! Cross-adapter parity matrix and end-to-end scenarios.
//!
//! Every test here drives a real server over TCP: reqwest as the HTTP
//! client, tokio-tungstenite as the WebSocket client. The parity matrix
//! runs each context operation against both engines and asserts identical
//! status, `Content-Type`, `Set-Cookie`, and body output.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use http::{Method, StatusCode};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as ClientMessage;
use tokio_util::sync::CancellationToken;

use lattice_core::{
    Context, Cookie, ErrorHandler, FieldError, HttpError, RouteBuilder, Router, SameSite,
    ServeHandle, Server, UpgradeData, handler, middleware,
};
use lattice_ws::{Hub, RoomConfig, RouterWsExt, WsConfig, ws_handler};

use crate::{AxumServer, HyperServer};

// =============================================================================
// Support
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Engine {
    Axum,
    Hyper,
}

const ENGINES: [Engine; 2] = [Engine::Axum, Engine::Hyper];

struct TestServer {
    server: Arc<dyn Server>,
    handle: ServeHandle,
}

impl TestServer {
    async fn start(engine: Engine, router: Router) -> Self {
        let server: Arc<dyn Server> = match engine {
            Engine::Axum => Arc::new(AxumServer::new(router)),
            Engine::Hyper => Arc::new(HyperServer::new(router)),
        };
        let handle = server.serve("127.0.0.1:0").await.expect("bind test server");
        Self { server, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.handle.local_addr())
    }

    fn ws_url(&self, path_and_query: &str) -> String {
        format!("ws://{}{path_and_query}", self.handle.local_addr())
    }

    async fn stop(&self) {
        let _ = self.server.shutdown(Duration::from_secs(2)).await;
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("build client")
}

// =============================================================================
// Routers under test
// =============================================================================

/// One endpoint per context operation, for the parity matrix.
fn ops_router() -> Router {
    let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());

    router
        .get(
            "/ops/json",
            handler(|ctx| async move { ctx.json(StatusCode::OK, json!({"ok": true})) }),
        )
        .unwrap();

    router
        .get(
            "/ops/text",
            handler(|ctx| async move { ctx.send_string(StatusCode::OK, "hello") }),
        )
        .unwrap();

    router
        .get(
            "/ops/empty",
            handler(|ctx| async move {
                ctx.set_status(StatusCode::NO_CONTENT);
                Ok(())
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/header",
            handler(|ctx| async move {
                ctx.set_header("x-request-id", "r-123");
                ctx.send_string(StatusCode::OK, "tagged")
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/cookie",
            handler(|ctx| async move {
                ctx.set_cookie(
                    Cookie::new("session", "abc123")
                        .with_path("/app")
                        .with_http_only(true)
                        .with_same_site(SameSite::Lax),
                );
                ctx.send_string(StatusCode::OK, "cookie set")
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/clear-cookie",
            handler(|ctx| async move {
                let original = Cookie::new("session", "abc123")
                    .with_path("/app")
                    .with_same_site(SameSite::Lax);
                ctx.set_cookie(Cookie::clearing(&original));
                ctx.send_string(StatusCode::OK, "cookie cleared")
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/redirect",
            handler(|ctx| async move { ctx.redirect("/ops/text", StatusCode::FOUND) }),
        )
        .unwrap();

    router
        .post(
            "/ops/echo-json",
            handler(|ctx| async move {
                let body: Value = ctx.as_ref().bind().await?;
                ctx.json(StatusCode::OK, json!({"received": body}))
            }),
        )
        .unwrap();

    router
        .post(
            "/ops/form",
            handler(|ctx| async move {
                let user = ctx.form_value("user").unwrap_or_default();
                ctx.json(StatusCode::OK, json!({"user": user}))
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/validation",
            handler(|_| async {
                Err(HttpError::validation(
                    "bad",
                    vec![FieldError::new("name", "required")],
                ))
            }),
        )
        .unwrap();

    router
        .get(
            "/ops/query",
            handler(|ctx| async move {
                let tags: Vec<String> = ctx
                    .queries()
                    .into_iter()
                    .filter(|(k, _)| k == "tag")
                    .map(|(_, v)| v)
                    .collect();
                ctx.json(StatusCode::OK, json!({"tags": tags, "last": ctx.query("tag")}))
            }),
        )
        .unwrap();

    router
        .get(
            "/params/:id/files/*path",
            handler(|ctx| async move {
                ctx.json(
                    StatusCode::OK,
                    json!({"id": ctx.param("id"), "path": ctx.param("path")}),
                )
            }),
        )
        .unwrap();

    router
}

/// The CRUD demo used by the end-to-end scenarios.
fn api_router() -> Router {
    let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());
    let store: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));

    #[derive(serde::Deserialize)]
    struct NewUser {
        #[serde(default)]
        name: String,
        #[serde(default)]
        email: String,
    }

    let create_store = store.clone();
    router
        .register(
            RouteBuilder::new(Method::POST, "/api/users")
                .name("users.create")
                .summary("Create a user")
                .handler(handler(move |ctx| {
                    let store = create_store.clone();
                    async move {
                        let input: NewUser = ctx.as_ref().bind().await?;
                        let mut fields = Vec::new();
                        if input.name.trim().is_empty() {
                            fields.push(FieldError::new("name", "name required"));
                        }
                        if !input.email.contains('@') || !input.email.contains('.') {
                            fields.push(FieldError::new("email", "email required"));
                        }
                        if !fields.is_empty() {
                            return Err(HttpError::validation("invalid user", fields));
                        }
                        let id = format!("u-{}", store.lock().unwrap().len() + 1);
                        let record = json!({"id": id, "name": input.name, "email": input.email});
                        store.lock().unwrap().insert(id.clone(), record.clone());
                        ctx.json(StatusCode::CREATED, record)
                    }
                })),
        )
        .unwrap();

    let show_store = store.clone();
    router
        .register(
            RouteBuilder::new(Method::GET, "/api/users/:id")
                .name("users.show")
                .summary("Fetch a user")
                .handler(handler(move |ctx| {
                    let store = show_store.clone();
                    async move {
                        let id = ctx.param_or("id", "");
                        let record = store.lock().unwrap().get(&id).cloned();
                        match record {
                            Some(record) => ctx.json(StatusCode::OK, record),
                            None => Err(HttpError::not_found(format!("no user {id}"))),
                        }
                    }
                })),
        )
        .unwrap();

    router
        .get(
            "/api/users",
            handler(|ctx| async move { ctx.json(StatusCode::OK, json!([])) }),
        )
        .unwrap();

    router
}

// =============================================================================
// Adapter parity matrix
// =============================================================================

struct Observed {
    status: StatusCode,
    content_type: Option<String>,
    set_cookies: Vec<String>,
    location: Option<String>,
    body: String,
}

async fn observe(client: &reqwest::Client, base: &str, case: &ParityCase) -> Observed {
    let url = format!("{base}{}", case.path);
    let mut request = match case.method {
        Method::GET => client.get(&url),
        Method::POST => client.post(&url),
        _ => unreachable!("unused method in matrix"),
    };
    if let Some((content_type, body)) = &case.body {
        if !content_type.is_empty() {
            request = request.header("content-type", *content_type);
        }
        request = request.body(body.to_string());
    }
    let response = request.send().await.expect("request");
    let status = response.status();
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let set_cookies = response
        .headers()
        .get_all("set-cookie")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let content_type = header("content-type");
    let location = header("location");
    let body = response.text().await.expect("body");
    Observed {
        status,
        content_type,
        set_cookies,
        location,
        body,
    }
}

struct ParityCase {
    label: &'static str,
    method: Method,
    path: &'static str,
    /// `(content_type, body)`; an empty content type sends none.
    body: Option<(&'static str, &'static str)>,
}

const fn get(label: &'static str, path: &'static str) -> ParityCase {
    ParityCase {
        label,
        method: Method::GET,
        path,
        body: None,
    }
}

#[tokio::test]
async fn adapters_produce_identical_output() {
    let cases = [
        get("json", "/ops/json"),
        get("text", "/ops/text"),
        get("empty", "/ops/empty"),
        get("header", "/ops/header"),
        get("cookie", "/ops/cookie"),
        get("clear-cookie", "/ops/clear-cookie"),
        get("redirect", "/ops/redirect"),
        get("validation", "/ops/validation"),
        get("query", "/ops/query?tag=a&tag=b"),
        get("params", "/params/42/files/css/site.css"),
        get("not-found", "/nope"),
        ParityCase {
            label: "method-not-allowed",
            method: Method::POST,
            path: "/ops/text",
            body: None,
        },
        ParityCase {
            label: "bind-json",
            method: Method::POST,
            path: "/ops/echo-json",
            body: Some(("application/json", r#"{"name":"Julie Smith"}"#)),
        },
        ParityCase {
            label: "bind-malformed",
            method: Method::POST,
            path: "/ops/echo-json",
            body: Some(("application/json", "{not json")),
        },
        ParityCase {
            label: "bind-no-content-type",
            method: Method::POST,
            path: "/ops/echo-json",
            body: Some(("", "{}")),
        },
        ParityCase {
            label: "form",
            method: Method::POST,
            path: "/ops/form",
            body: Some(("application/x-www-form-urlencoded", "user=julie&x=1")),
        },
    ];

    let axum = TestServer::start(Engine::Axum, ops_router()).await;
    let hyper = TestServer::start(Engine::Hyper, ops_router()).await;
    let client = client();

    for case in &cases {
        let a = observe(&client, &axum.url(""), case).await;
        let h = observe(&client, &hyper.url(""), case).await;
        assert_eq!(a.status, h.status, "status diverged for {}", case.label);
        assert_eq!(
            a.content_type, h.content_type,
            "content-type diverged for {}",
            case.label
        );
        assert_eq!(
            a.set_cookies, h.set_cookies,
            "set-cookie diverged for {}",
            case.label
        );
        assert_eq!(a.location, h.location, "location diverged for {}", case.label);
        assert_eq!(a.body, h.body, "body diverged for {}", case.label);
    }

    axum.stop().await;
    hyper.stop().await;
}

// =============================================================================
// HTTP end-to-end scenarios
// =============================================================================

#[tokio::test]
async fn crud_roundtrip_and_errors() {
    for engine in ENGINES {
        let server = TestServer::start(engine, api_router()).await;
        let client = client();

        // E1: create then fetch.
        let response = client
            .post(server.url("/api/users"))
            .json(&json!({"name": "Julie Smith", "email": "julie.smith@example.com"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED, "{engine:?}");
        let created: Value = response.json().await.unwrap();
        let id = created["id"].as_str().expect("generated id").to_string();

        let fetched = client
            .get(server.url(&format!("/api/users/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK, "{engine:?}");
        let fetched: Value = fetched.json().await.unwrap();
        assert_eq!(fetched["name"], "Julie Smith");
        assert_eq!(fetched["email"], "julie.smith@example.com");

        // E2: validation failure lists both fields.
        let invalid = client
            .post(server.url("/api/users"))
            .json(&json!({"email": "x@y"}))
            .send()
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY, "{engine:?}");
        let envelope: Value = invalid.json().await.unwrap();
        assert_eq!(envelope["error"]["code"], "VALIDATION_FAILED");
        let errors = envelope["error"]["validation_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["field"], "name");
        assert_eq!(errors[0]["message"], "name required");
        assert_eq!(errors[1]["field"], "email");
        assert_eq!(errors[1]["message"], "email required");

        // E3: path exists under other methods only.
        let patched = client
            .patch(server.url("/api/users"))
            .send()
            .await
            .unwrap();
        assert_eq!(patched.status(), StatusCode::METHOD_NOT_ALLOWED, "{engine:?}");
        let envelope: Value = patched.json().await.unwrap();
        assert_eq!(envelope["error"]["code"], "METHOD_NOT_ALLOWED");

        server.stop().await;
    }
}

#[tokio::test]
async fn cookie_clearing_emits_exact_header() {
    let server = TestServer::start(Engine::Axum, ops_router()).await;
    let client = client();

    let set = client.get(server.url("/ops/cookie")).send().await.unwrap();
    let set_cookie = set.headers().get("set-cookie").unwrap().to_str().unwrap();
    assert_eq!(
        set_cookie,
        "session=abc123; Path=/app; HttpOnly; SameSite=Lax"
    );

    let cleared = client
        .get(server.url("/ops/clear-cookie"))
        .send()
        .await
        .unwrap();
    let clear_cookie = cleared
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    assert_eq!(
        clear_cookie,
        "session=; Path=/app; Max-Age=-1; Expires=Thu, 01 Jan 1970 00:00:00 GMT; SameSite=Lax"
    );

    server.stop().await;
}

#[tokio::test]
async fn middleware_injected_locals_take_precedence() {
    let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());
    router.use_middleware(middleware(|next| {
        handler(move |ctx| {
            let next = next.clone();
            async move {
                let mut flash = serde_json::Map::new();
                flash.insert("note".into(), json!("from-middleware"));
                ctx.merge_locals("flash", flash);
                next(ctx).await
            }
        })
    }));
    router
        .get(
            "/flash",
            handler(|ctx| async move {
                // The handler's own fallback must lose to the injected value.
                let flash = ctx
                    .local("flash")
                    .unwrap_or_else(|| json!({"note": "handler-default"}));
                ctx.json(StatusCode::OK, flash)
            }),
        )
        .unwrap();

    let server = TestServer::start(Engine::Hyper, router).await;
    let body: Value = client()
        .get(server.url("/flash"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["note"], "from-middleware");
    server.stop().await;
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    for engine in ENGINES {
        let server = TestServer::start(engine, ops_router()).await;
        let url = server.url("/ops/text");
        let client = client();
        assert_eq!(
            client.get(&url).send().await.unwrap().status(),
            StatusCode::OK
        );

        server.stop().await;

        let err = client.get(&url).send().await;
        assert!(err.is_err(), "{engine:?} still accepting after shutdown");
    }
}

// =============================================================================
// WebSocket end-to-end scenarios
// =============================================================================

/// Reads frames until a Text frame arrives, answering nothing; control
/// frames are skipped (tungstenite answers Pings internally).
async fn next_text<S>(stream: &mut S) -> Value
where
    S: futures::Stream<Item = Result<ClientMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame ok");
        if let ClientMessage::Text(text) = frame {
            return serde_json::from_str(text.as_str()).expect("json frame");
        }
    }
}

#[tokio::test]
async fn keepalive_pings_and_disconnects_silent_peers() {
    for engine in ENGINES {
        let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());
        let config = WsConfig::new()
            .with_pong_wait(Duration::from_millis(600))
            .with_ping_period(Duration::from_millis(200));
        router
            .websocket(
                "/ws",
                config,
                ws_handler(|ctx| async move {
                    while ctx.read_message().await.is_ok() {}
                    Ok(())
                }),
            )
            .unwrap();
        let server = TestServer::start(engine, router).await;

        // E4a: a responsive client sees a Ping and stays connected past
        // pong_wait (tungstenite answers Pings while the stream is read).
        let (mut responsive, _) = connect_async(server.ws_url("/ws")).await.unwrap();
        let mut saw_ping = false;
        let alive_until = tokio::time::Instant::now() + Duration::from_millis(900);
        while tokio::time::Instant::now() < alive_until {
            match tokio::time::timeout(Duration::from_millis(300), responsive.next()).await {
                Ok(Some(Ok(ClientMessage::Ping(_)))) => saw_ping = true,
                Ok(Some(Ok(ClientMessage::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => {
                    panic!("{engine:?}: responsive client was disconnected")
                }
                _ => {}
            }
        }
        assert!(saw_ping, "{engine:?}: no ping within the keepalive window");
        responsive.close(None).await.unwrap();

        // E4b: a client that never reads (so never pongs) is cut off within
        // pong_wait plus slack, with close code 1000.
        let (mut silent, _) = connect_async(server.ws_url("/ws")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
        loop {
            match tokio::time::timeout_at(deadline, silent.next()).await {
                Ok(Some(Ok(ClientMessage::Close(close)))) => {
                    let code = close.map(|f| u16::from(f.code)).unwrap_or(1000);
                    assert!(
                        code == 1000 || code == 1011,
                        "{engine:?}: unexpected close code {code}"
                    );
                    break;
                }
                // Pings buffered ahead of the Close frame.
                Ok(Some(Ok(_))) => continue,
                // Stream end also proves the disconnect.
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => panic!("{engine:?}: not disconnected within pong_wait + slack"),
            }
        }

        server.stop().await;
    }
}

fn chat_router(hub: Hub) -> Router {
    let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());
    let chat_hub = hub.clone();
    router
        .websocket(
            "/chat",
            WsConfig::new(),
            ws_handler(move |ctx| {
                let hub = chat_hub.clone();
                async move {
                    let client = hub.register(ctx.clone())?;
                    if let Some(user) = ctx.query("user") {
                        client.set_state("username", json!(user));
                    }
                    let room = hub.room("lobby")?;
                    let never = CancellationToken::new();
                    room.add_client(&never, &client).await?;
                    ctx.write_json(&json!({"type": "joined", "roomId": "lobby"}))
                        .await?;

                    loop {
                        let value: Value = match ctx.read_json().await {
                            Ok(value) => value,
                            Err(_) => break,
                        };
                        if value["type"] == "room:message" {
                            let room_id = value["roomId"].as_str().unwrap_or("lobby");
                            if let Ok(room) = hub.room(room_id) {
                                let _ = room
                                    .emit(
                                        "room:message",
                                        json!({
                                            "message": value["message"],
                                            "username": client.state("username"),
                                        }),
                                    )
                                    .await;
                            }
                        }
                    }
                    hub.unregister(client.id()).await;
                    Ok(())
                }
            }),
        )
        .unwrap();
    router
}

#[tokio::test]
async fn room_broadcast_reaches_both_clients_including_sender() {
    for engine in ENGINES {
        let hub = Hub::new();
        hub.create_room("lobby", "Lobby", RoomConfig::new()).unwrap();
        let server = TestServer::start(engine, chat_router(hub.clone())).await;

        let (mut alice, _) = connect_async(server.ws_url("/chat?user=alice"))
            .await
            .unwrap();
        let (mut bob, _) = connect_async(server.ws_url("/chat?user=bob")).await.unwrap();
        assert_eq!(next_text(&mut alice).await["type"], "joined");
        assert_eq!(next_text(&mut bob).await["type"], "joined");

        alice
            .send(ClientMessage::Text(
                json!({"type": "room:message", "roomId": "lobby", "message": "hi"})
                    .to_string()
                    .into(),
            ))
            .await
            .unwrap();

        // The sender receives its own message too.
        for (who, stream) in [("alice", &mut alice), ("bob", &mut bob)] {
            let frame = next_text(stream).await;
            assert_eq!(frame["type"], "room:message", "{engine:?} {who}");
            assert_eq!(frame["roomId"], "lobby");
            assert_eq!(frame["payload"]["message"], "hi");
            assert_eq!(frame["payload"]["username"], "alice");
        }

        alice.close(None).await.unwrap();
        bob.close(None).await.unwrap();
        hub.close().await;
        server.stop().await;
    }
}

#[tokio::test]
async fn pre_upgrade_hook_gates_the_handshake() {
    for engine in ENGINES {
        let mut router = Router::new().with_middleware(ErrorHandler::new().into_middleware());
        let config = WsConfig::new()
            .on_pre_upgrade(|ctx| async move {
                match ctx.query("token").as_deref() {
                    Some("good") => {
                        let mut data = UpgradeData::new();
                        data.insert("claims", json!({"sub": "julie", "scope": "chat"}));
                        Ok(data)
                    }
                    _ => Err(HttpError::bad_request("invalid token")),
                }
            })
            .on_connect(|ws| async move {
                let claims = ws.upgrade_data("claims").unwrap_or(Value::Null);
                ws.write_json(&json!({"type": "welcome", "claims": claims}))
                    .await
            });
        router
            .websocket(
                "/ws",
                config,
                ws_handler(|ctx| async move {
                    while ctx.read_message().await.is_ok() {}
                    Ok(())
                }),
            )
            .unwrap();
        let server = TestServer::start(engine, router).await;

        // E6a: rejected before the switch, with an HTTP error response.
        let rejected = connect_async(server.ws_url("/ws?token=bad")).await;
        match rejected {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{engine:?}");
            }
            other => panic!("{engine:?}: expected HTTP rejection, got {other:?}"),
        }

        // E6b: accepted, and on_connect observes the claims.
        let (mut accepted, _) = connect_async(server.ws_url("/ws?token=good")).await.unwrap();
        let welcome = next_text(&mut accepted).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["claims"]["sub"], "julie");
        accepted.close(None).await.unwrap();

        server.stop().await;
    }
}
