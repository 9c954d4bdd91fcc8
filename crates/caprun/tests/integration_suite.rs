//! Integration tests for the caprun runtime: a host component system and a
//! guest client wired over an in-memory duplex transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

use caprpc::ErrorObject;
use caprpc::Params;

use caprun::guest::GuestClient;
use caprun::peer;
use caprun::registry::Component;
use caprun::registry::ComponentOptions;
use caprun::registry::ComponentRegistry;
use caprun::registry::HookError;
use caprun::system::SystemBuilder;
use caprun::system::Worker;
use caprun::system::SYSTEM_DID_UNMOUNT;
use caprun::system::SYSTEM_WILL_ENABLE;
use caprun::system::SYSTEM_WILL_UNMOUNT;
use caprun::transport::Transport;
use caprun::transport::TransportEvent;
use caprun::transport;

use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

// --- In-memory duplex transport ---

/// One side of an in-memory duplex pipe.
struct DuplexTransport {
    out: mpsc::UnboundedSender<TransportEvent>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, message: &str) -> transport::Result<()> {
        self.out
            .send(TransportEvent::Message(message.to_string()))
            .map_err(|_| transport::Error::ConnectionLost("pipe closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<TransportEvent>> {
        let mut inbound = self.inbound.lock().await;
        Ok(inbound.recv().await)
    }
}

/// Injects connect signals into both sides of a pair.
struct PipeControls {
    to_host: mpsc::UnboundedSender<TransportEvent>,
    to_guest: mpsc::UnboundedSender<TransportEvent>,
}

impl PipeControls {
    fn connect_both(&self) {
        let _ = self.to_host.send(TransportEvent::Connected);
        let _ = self.to_guest.send(TransportEvent::Connected);
    }
}

/// Creates a connected pair: what the host sends, the guest receives, and
/// vice versa. Connect signals are injected through the controls.
fn duplex_pair() -> (DuplexTransport, DuplexTransport, PipeControls) {
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
    let (to_guest_tx, to_guest_rx) = mpsc::unbounded_channel();

    let host = DuplexTransport {
        out: to_guest_tx.clone(),
        inbound: AsyncMutex::new(to_host_rx),
    };
    let guest = DuplexTransport {
        out: to_host_tx.clone(),
        inbound: AsyncMutex::new(to_guest_rx),
    };
    let controls = PipeControls {
        to_host: to_host_tx,
        to_guest: to_guest_tx,
    };

    (host, guest, controls)
}

// --- Test fixtures ---

type EventLog = Arc<Mutex<Vec<String>>>;

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for: {}", what);
}

struct TestWorker {
    log: EventLog,
}

#[async_trait]
impl Worker for TestWorker {
    async fn terminate(&self) {
        self.log.lock().push("worker.terminate".into());
    }
}

/// Arithmetic component recording its lifecycle into a shared log.
struct Calc {
    log: EventLog,
}

#[async_trait]
impl Component for Calc {
    async fn component_did_mount(&self) -> std::result::Result<(), HookError> {
        self.log.lock().push("Calc.mount".into());
        Ok(())
    }

    async fn component_will_unmount(&self) -> std::result::Result<(), HookError> {
        self.log.lock().push("Calc.unmount".into());
        Ok(())
    }
}

fn calc_factory(log: EventLog) -> impl Fn(ComponentOptions) -> Calc + Send + Sync + 'static {
    move |options| {
        let work_log = log.clone();
        options.expose("add", move |params| {
            let work_log = work_log.clone();
            Box::pin(async move {
                work_log.lock().push("Calc.add".into());
                let Some(Params::Array(items)) = params else {
                    return Err(ErrorObject::new("add expects positional params"));
                };
                let sum: i64 = items.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            })
        });
        options.expose("fail", |_params| {
            Box::pin(async move { Err(ErrorObject::new("boom").with_stack("at Calc.fail")) })
        });
        Calc { log: log.clone() }
    }
}

fn registry_with_calc(log: &EventLog) -> Arc<ComponentRegistry> {
    let registry = Arc::new(ComponentRegistry::new());
    registry
        .register("Calc", calc_factory(log.clone()))
        .expect("registration failed");
    registry
}

// --- Test 1: Echo round-trip through a component proxy ---

#[tokio::test]
async fn test_echo_round_trip() -> Result<()> {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    let calc = guest.component("Calc").await?;
    let result = calc.invoke("add", vec![json!(2), json!(3)]).await?;
    assert_eq!(result, json!(5));

    // The reflective method list came along with the proxy.
    assert!(calc.methods().contains(&"add".to_string()));
    assert!(calc.methods().contains(&"fail".to_string()));

    Ok(())
}

// --- Test 2: Remote failure preserves the remote message ---

#[tokio::test]
async fn test_remote_failure_fidelity() -> Result<()> {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    let calc = guest.component("Calc").await?;
    let error = calc.invoke("fail", vec![]).await.unwrap_err();

    match error {
        peer::Error::Remote(remote) => {
            assert_eq!(remote.message(), "boom");
            assert_eq!(remote.stack(), Some("at Calc.fail"));
        }
        other => panic!("Expected Remote error, got {:?}", other),
    }

    Ok(())
}

// --- Test 3: Unknown component names are listed in the error ---

#[tokio::test]
async fn test_load_components_missing_names() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    let error = guest.component("Ghost").await.unwrap_err();
    match error {
        peer::Error::Remote(remote) => {
            assert!(remote.message().contains("Components not found: Ghost"));
        }
        other => panic!("Expected Remote error, got {:?}", other),
    }
}

// --- Test 4: Unknown method on a loaded component round-trips as -32601 ---

#[tokio::test]
async fn test_unknown_method_round_trip() -> Result<()> {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    let calc = guest.component_with_methods("Calc", &["add"]).await?;
    let error = calc.invoke("NotDeclared", vec![]).await.unwrap_err();

    match error {
        peer::Error::Remote(remote) => {
            assert_eq!(remote.code(), Some(caprpc::METHOD_NOT_FOUND));
            assert!(remote.message().contains("Method not found"));
        }
        other => panic!("Expected Remote error, got {:?}", other),
    }

    Ok(())
}

// --- Test 5: Full lifecycle order, enable barrier included ---

#[tokio::test]
async fn test_component_lifecycle_order() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .worker(Box::new(TestWorker { log: log.clone() }))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    for event in [SYSTEM_WILL_ENABLE, SYSTEM_WILL_UNMOUNT, SYSTEM_DID_UNMOUNT] {
        let sink = log.clone();
        system.on(event, move |_args| {
            sink.lock().push(event.to_string());
            Ok(())
        });
    }

    controls.connect_both();

    // Materialize the instance before enabling; it must not mount yet.
    system
        .get_component_instance("Calc")
        .await
        .expect("instance creation failed");

    // A guest call issued before enable parks on the gate.
    let queued_guest = {
        let guest = Arc::clone(&guest);
        tokio::spawn(async move {
            let calc = guest.component_with_methods("Calc", &["add"]).await?;
            calc.invoke("add", vec![json!(1), json!(2)]).await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    let snapshot = log.lock().clone();
    assert!(
        snapshot.is_empty(),
        "nothing may run before enable, got {:?}",
        snapshot
    );

    system.enable().await;

    let result = queued_guest.await.expect("guest task panicked");
    assert_eq!(result.expect("queued call failed"), json!(3));

    system.unmount().await;
    guest.wait_for_shutdown().await;

    let entries = log.lock().clone();
    let expected = [
        SYSTEM_WILL_ENABLE,
        "Calc.mount",
        "Calc.add",
        SYSTEM_WILL_UNMOUNT,
        "Calc.unmount",
        "worker.terminate",
        SYSTEM_DID_UNMOUNT,
    ];
    assert_eq!(entries, expected, "lifecycle order mismatch");
}

// --- Test 6: Unmount is idempotent and rejects in-flight calls ---

#[tokio::test]
async fn test_unmount_idempotent_and_rejects_pending() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .worker(Box::new(TestWorker { log: log.clone() }))
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    // A host-initiated call whose guest handler never completes, so the
    // pending entry survives until teardown rejects it.
    guest.peer().expose("Guest.unanswered", |_params| {
        Box::pin(async move {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        })
    });
    let dangling = system
        .peer()
        .call("Guest.unanswered", None)
        .expect("call failed");

    system.unmount().await;
    system.unmount().await;

    match dangling.await.unwrap_err() {
        peer::Error::PeerClosed => {}
        other => panic!("Expected PeerClosed, got {:?}", other),
    }

    // Exactly one teardown ran.
    let entries = log.lock().clone();
    let terminations = entries
        .iter()
        .filter(|entry| *entry == "worker.terminate")
        .count();
    assert_eq!(terminations, 1);
}

// --- Test 7: Typed instance lookup through the registry tag ---

#[tokio::test]
async fn test_typed_instance_lookup() {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, _guest_transport, controls) = duplex_pair();

    let system = SystemBuilder::new("host")
        .registry(registry_with_calc(&log))
        .build(Box::new(host_transport));

    controls.connect_both();

    system.instance_of::<Calc>().await.expect("typed lookup failed");

    struct Unregistered;
    impl Component for Unregistered {}

    assert!(system.instance_of::<Unregistered>().await.is_err());
}

// --- Test 8: Host component events reach guest subscribers ---

#[tokio::test]
async fn test_component_event_to_guest() -> Result<()> {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (host_transport, guest_transport, controls) = duplex_pair();

    let registry = Arc::new(ComponentRegistry::new());
    let options_slot: Arc<Mutex<Option<ComponentOptions>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&options_slot);
    registry
        .register("Beacon", move |options| {
            slot.lock().replace(options);
            Beacon
        })
        .expect("registration failed");

    let system = SystemBuilder::new("host")
        .registry(registry)
        .build(Box::new(host_transport));
    let guest = GuestClient::new(Box::new(guest_transport));

    controls.connect_both();
    system.enable().await;

    let beacon = guest.component_with_methods("Beacon", &[]).await?;

    let seen = log.clone();
    beacon.on("Pulse", move |args| {
        seen.lock().push(format!("pulse:{:?}", args));
        Ok(())
    });

    let options = options_slot.lock().take().expect("factory not invoked");
    options.notify("Pulse", Some(json!([1])))?;

    wait_until("pulse delivery", || !log.lock().is_empty()).await;
    assert!(log.lock()[0].starts_with("pulse:"));

    Ok(())
}

struct Beacon;

impl Component for Beacon {}
