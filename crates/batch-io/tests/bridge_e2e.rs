use batch_core::{AddressMap, PhysicalAddress, Protocol, Reading, TagValue};
use batch_io::session::SessionConfig;
use batch_io::{
    CommandGateway, FanoutHub, GatewayConfig, Poller, ServerBuilder, ServerHandle, Session,
    SimHandle, SimulatedPlc, TokenValidator,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PULSE: Duration = Duration::from_millis(200);

struct Bridge {
    plc: SimHandle,
    map: Arc<AddressMap>,
    session: Arc<Session>,
    hub: FanoutHub,
    server: ServerHandle,
    http: reqwest::Client,
}

impl Bridge {
    async fn start(map: AddressMap, auth: Option<TokenValidator>) -> Bridge {
        let plc = SimHandle::default();
        let map = Arc::new(map);
        let session = Arc::new(Session::new(
            Box::new(SimulatedPlc::with_handle(plc.clone())),
            map.clone(),
            SessionConfig::default(),
        ));
        session.connect().await.expect("sim connects");
        let hub = FanoutHub::default();
        let gateway = Arc::new(CommandGateway::new(
            session.clone(),
            hub.clone(),
            GatewayConfig {
                pulse_duration: PULSE,
                ..GatewayConfig::default()
            },
        ));
        let mut builder = ServerBuilder::new(
            "127.0.0.1:0".parse().unwrap(),
            gateway,
            hub.clone(),
        );
        if let Some(validator) = auth {
            builder = builder.with_auth(validator);
        }
        let server = builder.spawn().await.expect("server binds");
        plc.clear_calls();
        Bridge {
            plc,
            map,
            session,
            hub,
            server,
            http: reqwest::Client::new(),
        }
    }

    async fn builtin() -> Bridge {
        Bridge::start(AddressMap::builtin(Protocol::S7), None).await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.local_addr(), path)
    }

    fn addr(&self, tag: &str) -> PhysicalAddress {
        self.map.resolve(tag).unwrap()
    }

    fn writes_to(&self, tag: &str) -> Vec<(Instant, TagValue)> {
        let addr = self.addr(tag);
        self.plc
            .writes()
            .into_iter()
            .filter(|(_, a, _)| *a == addr)
            .map(|(at, _, v)| (at, v))
            .collect()
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self.http.post(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn ws(&self) -> Ws {
        let before = self.hub.subscriber_count();
        let (ws, _) = connect_async(format!("ws://{}/ws", self.server.local_addr()))
            .await
            .expect("ws connects");
        wait_until(|| self.hub.subscriber_count() > before).await;
        ws
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_of_type(ws: &mut Ws, msg_type: &str) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == msg_type {
                return value;
            }
        }
    }
}

async fn send(ws: &mut Ws, message: Value) {
    ws.send(WsMessage::Text(message.to_string())).await.unwrap();
}

#[tokio::test]
async fn start_pulses_inicio_on_then_off_without_blocking_the_caller() {
    let bridge = Bridge::builtin().await;
    assert!(bridge.plc.set_tag(&bridge.map, "ARIDO1", TagValue::Int(12)));

    let (status, body) = bridge.post("/api/start", json!({})).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body, json!({ "ok": true }));
    assert_eq!(bridge.writes_to("INICIO").len(), 1);

    wait_until(|| bridge.writes_to("INICIO").len() == 2).await;
    let writes = bridge.writes_to("INICIO");
    assert_eq!(writes[0].1, TagValue::Bool(true));
    assert_eq!(writes[1].1, TagValue::Bool(false));
    assert!(writes[1].0 - writes[0].0 >= PULSE);
}

#[tokio::test]
async fn start_requires_a_positive_arido() {
    let bridge = Bridge::builtin().await;

    let (status, body) = bridge.post("/api/start", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "validation");
    assert!(bridge.plc.writes().is_empty());

    bridge.plc.set_tag(&bridge.map, "ARIDO3", TagValue::Int(4));
    let (status, _) = bridge.post("/write", json!({ "tag": "INICIO", "value": true })).await;
    assert_eq!(status, 200);
    assert_eq!(bridge.writes_to("INICIO")[0].1, TagValue::Bool(true));
}

#[tokio::test]
async fn out_of_range_set_point_never_reaches_the_plc() {
    let bridge = Bridge::builtin().await;

    let (status, body) = bridge.post("/write", json!({ "tag": "ARIDO1", "value": 150 })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "validation");

    let (status, body) = bridge.post("/write", json!({ "tag": "NOPE", "value": 1 })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "unknown_tag");

    assert!(bridge.plc.calls().is_empty());

    let (status, _) = bridge.post("/write", json!({ "tag": "arido1", "value": "40" })).await;
    assert_eq!(status, 200);
    assert_eq!(bridge.plc.value(&bridge.addr("ARIDO1")), TagValue::Int(40));
}

#[tokio::test]
async fn malformed_http_body_uses_the_error_shape() {
    let bridge = Bridge::builtin().await;
    let response = bridge
        .http
        .post(bridge.url("/api/manual"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "malformed");

    let (status, body) = bridge.post("/api/manual", json!({ "action": "sideways" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn disconnected_plc_maps_to_service_unavailable() {
    let bridge = Bridge::builtin().await;
    bridge.session.close().await;

    let (status, body) = bridge.post("/api/reset", json!({})).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"], "not_connected");

    let status: Value = bridge
        .http
        .get(bridge.url("/api/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
    assert_eq!(status["session"], "disconnected");
}

#[tokio::test]
async fn manual_tare_holds_until_released() {
    let bridge = Bridge::builtin().await;

    let (status, _) = bridge.post("/api/manual", json!({ "action": "on" })).await;
    assert_eq!(status, 200);
    assert_eq!(bridge.plc.value(&bridge.addr("TARA")), TagValue::Bool(true));

    let (status, _) = bridge.post("/api/manual", json!({ "action": "off" })).await;
    assert_eq!(status, 200);
    let writes = bridge.writes_to("TARA");
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].1, TagValue::Bool(false));
}

#[tokio::test]
async fn dropped_subscriber_releases_its_hold() {
    let bridge = Bridge::builtin().await;
    let mut ws = bridge.ws().await;

    send(&mut ws, json!({ "type": "set-tara", "data": { "action": "press" } })).await;
    let reply = next_of_type(&mut ws, "command-result").await;
    assert_eq!(reply["data"], json!({ "ok": true }));
    assert_eq!(bridge.plc.value(&bridge.addr("TARA")), TagValue::Bool(true));

    drop(ws);
    wait_until(|| bridge.writes_to("TARA").len() == 2).await;
    assert_eq!(bridge.writes_to("TARA")[1].1, TagValue::Bool(false));
}

#[tokio::test]
async fn subscribers_receive_the_polled_snapshot() {
    let map = AddressMap::from_pairs(
        Protocol::S7,
        [("ARIDO1", "VW0"), ("COMP1", "V8.1"), ("PESO", "VW6")],
    )
    .unwrap();
    let bridge = Bridge::start(map, None).await;
    bridge.plc.set_tag(&bridge.map, "ARIDO1", TagValue::Int(12));
    bridge.plc.set_tag(&bridge.map, "COMP1", TagValue::Bool(true));
    bridge.plc.set_tag(&bridge.map, "PESO", TagValue::Int(305));

    let mut ws = bridge.ws().await;
    let mut poller = Poller::new(bridge.session.clone(), bridge.hub.clone(), Duration::from_millis(100));
    poller.tick().await;

    let update = next_of_type(&mut ws, "plc-update").await;
    let data = &update["data"];
    assert_eq!(data["ARIDO1"], 12);
    assert_eq!(data["COMP1"], true);
    assert_eq!(data["PESO"], 305);
    assert_eq!(data["running"], true);
    assert_eq!(data["connected"], true);
    assert!(data["timestamp"].as_u64().unwrap() > 0);

    let latest: Value = bridge
        .http
        .get(bridge.url("/api/snapshot"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["ok"], true);
    assert_eq!(latest["data"]["PESO"], 305);
}

#[tokio::test]
async fn partial_read_publishes_the_tags_that_answered() {
    let map = AddressMap::from_pairs(
        Protocol::S7,
        [
            ("ARIDO1", "VW0"),
            ("ARIDO2", "VW2"),
            ("PESO", "VW6"),
            ("COMP1", "V8.1"),
            ("COMP2", "V8.2"),
        ],
    )
    .unwrap();
    let bridge = Bridge::start(map, None).await;
    bridge.plc.set_missing(bridge.addr("ARIDO2"));
    bridge.plc.set_missing(bridge.addr("COMP2"));
    bridge.plc.set_tag(&bridge.map, "ARIDO1", TagValue::Int(42));
    bridge.plc.set_tag(&bridge.map, "PESO", TagValue::Int(917));
    bridge.plc.set_tag(&bridge.map, "COMP1", TagValue::Bool(true));

    let mut poller = Poller::new(bridge.session.clone(), bridge.hub.clone(), Duration::from_millis(100));
    let snapshot = poller.tick().await;
    assert!(snapshot.connected);
    assert_eq!(snapshot.values.len(), 3);
    assert_eq!(snapshot.get("ARIDO1"), Some(&Reading::Value(TagValue::Int(42))));
    assert_eq!(snapshot.get("PESO"), Some(&Reading::Value(TagValue::Int(917))));
    assert_eq!(snapshot.get("COMP1"), Some(&Reading::Value(TagValue::Bool(true))));
    assert!(snapshot.running);

    let json = serde_json::to_value(snapshot.as_ref()).unwrap();
    assert_eq!(json["ARIDO1"], 42);
    assert_eq!(json["PESO"], 917);
    assert_eq!(json["COMP1"], true);
    assert!(snapshot.get("ARIDO2").is_none());
    assert!(snapshot.get("COMP2").is_none());
    assert_eq!(poller.stats().partial, 1);
}

#[tokio::test]
async fn polling_and_commands_never_overlap_on_the_link() {
    let bridge = Bridge::builtin().await;
    bridge.plc.set_latency(Duration::from_millis(15));
    bridge.plc.set_tag(&bridge.map, "ARIDO1", TagValue::Int(5));

    let poller = Poller::new(bridge.session.clone(), bridge.hub.clone(), Duration::from_millis(5));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let polling = tokio::spawn(poller.run(stop_rx));

    for value in 0..5 {
        let (status, _) = bridge.post("/write", json!({ "tag": "ARIDO2", "value": value })).await;
        assert_eq!(status, 200);
    }
    let (status, _) = bridge.post("/api/start", json!({})).await;
    assert_eq!(status, 200);

    tokio::time::sleep(PULSE + Duration::from_millis(100)).await;
    stop_tx.send(true).unwrap();
    let stats = polling.await.unwrap();
    assert!(stats.ticks >= 2);
    assert_eq!(bridge.plc.max_in_flight(), 1);
}

#[tokio::test]
async fn ws_commands_get_a_private_reply() {
    let bridge = Bridge::builtin().await;
    let mut sender = bridge.ws().await;
    let mut other = bridge.ws().await;

    send(&mut sender, json!({ "type": "set-arido", "data": { "tag": "ARIDO2", "value": 150 } })).await;
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["error"], "validation");

    send(&mut sender, json!({ "type": "set-arido", "data": { "tag": "COMP1", "value": true } })).await;
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["error"], "validation");
    send(&mut sender, json!({ "type": "set-compuerta", "data": { "tag": "ARIDO1", "value": 10 } })).await;
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["error"], "validation");
    assert_eq!(bridge.plc.value(&bridge.addr("COMP1")), TagValue::Bool(false));
    assert_eq!(bridge.plc.value(&bridge.addr("ARIDO1")), TagValue::Int(0));

    send(&mut sender, json!({ "type": "set-compuerta", "data": { "compuerta": 2, "value": true } })).await;
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["ok"], true);
    assert_eq!(bridge.plc.value(&bridge.addr("COMP2")), TagValue::Bool(true));

    send(&mut sender, json!({ "type": "echo", "data": { "type": "reset" } })).await;
    let echo = next_of_type(&mut other, "echo").await;
    assert_eq!(echo["data"], json!({ "type": "reset" }));
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["ok"], true);

    send(&mut sender, json!({ "type": "launch-rockets" })).await;
    let reply = next_of_type(&mut sender, "command-result").await;
    assert_eq!(reply["data"]["error"], "malformed");
}

#[tokio::test]
async fn commands_require_a_token_when_auth_is_enabled() {
    let validator = TokenValidator::new(b"plant-secret".to_vec(), 300);
    let token = validator.generate_token("maria");
    let bridge = Bridge::start(AddressMap::builtin(Protocol::S7), Some(validator)).await;

    let (status, body) = bridge.post("/write", json!({ "tag": "COMP1", "value": true })).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "auth");

    let response = bridge
        .http
        .post(bridge.url("/write"))
        .bearer_auth(&token)
        .json(&json!({ "tag": "COMP1", "value": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let mut ws = bridge.ws().await;
    send(&mut ws, json!({ "type": "set-tara", "data": { "action": "press" } })).await;
    let reply = next_of_type(&mut ws, "command-result").await;
    assert_eq!(reply["data"]["error"], "auth");

    send(
        &mut ws,
        json!({ "type": "set-tara", "data": { "action": "release" }, "auth_token": token }),
    )
    .await;
    let reply = next_of_type(&mut ws, "command-result").await;
    assert_eq!(reply["data"]["ok"], true);

    // Echo never touches the PLC and needs no token.
    send(&mut ws, json!({ "type": "echo", "data": { "type": "start" } })).await;
    next_of_type(&mut ws, "echo").await;
}
