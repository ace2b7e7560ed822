use super::*;
use crate::config::ReactorConfig;
use bytes::BytesMut;
use crossbeam::channel::{self, Receiver, Sender};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener as StdListener, TcpStream as StdStream};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Observed {
    Established(ConnectionInfo),
    Data(Vec<u8>),
    Error { timeout: bool, rejected: bool },
    Disconnected,
}

/// Reports every callback; optionally echoes, greets or rejects.
struct Recorder {
    events: Sender<Observed>,
    out: BytesMut,
    echo: bool,
    greeting: Option<&'static [u8]>,
    reject_data: bool,
}

impl Recorder {
    fn new(events: Sender<Observed>) -> Self {
        Self {
            events,
            out: BytesMut::new(),
            echo: false,
            greeting: None,
            reject_data: false,
        }
    }
}

impl ConnectionListener for Recorder {
    fn on_connection_established(&mut self, info: &ConnectionInfo) -> Result<(), ListenerError> {
        if let Some(greeting) = self.greeting {
            self.out.extend_from_slice(greeting);
        }
        let _ = self.events.send(Observed::Established(*info));
        Ok(())
    }

    fn on_data_received(&mut self, data: &[u8]) -> Result<(), ListenerError> {
        if self.reject_data {
            return Err("unwanted data".into());
        }
        if self.echo {
            self.out.extend_from_slice(data);
        }
        let _ = self.events.send(Observed::Data(data.to_vec()));
        Ok(())
    }

    fn outbound(&mut self) -> &mut BytesMut {
        &mut self.out
    }

    fn on_error(&mut self, error: &ReactorError) {
        let _ = self.events.send(Observed::Error {
            timeout: error.is_timeout(),
            rejected: matches!(error, ReactorError::Rejected(_)),
        });
    }

    fn on_disconnect(&mut self) {
        let _ = self.events.send(Observed::Disconnected);
    }
}

fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn start(
    config: ReactorConfig,
    configure: fn(Recorder) -> Recorder,
) -> (
    ReactorHandle,
    std::thread::JoinHandle<std::io::Result<()>>,
    SocketAddr,
    Receiver<Observed>,
) {
    let (tx, rx) = channel::unbounded();
    let mut reactor = Reactor::new(config).unwrap();
    let addr = reactor
        .listen(localhost(), move |_addr: SocketAddr| {
            Some(Box::new(configure(Recorder::new(tx.clone()))) as Box<dyn ConnectionListener>)
        })
        .unwrap();
    let handle = reactor.handle();
    let thread = reactor.spawn().unwrap();
    (handle, thread, addr, rx)
}

fn recv_data(rx: &Receiver<Observed>, expected_len: usize) -> Vec<u8> {
    let mut data = Vec::new();
    while data.len() < expected_len {
        match rx.recv_timeout(WAIT).unwrap() {
            Observed::Data(chunk) => data.extend(chunk),
            Observed::Established(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
    data
}

#[test]
fn test_outbound_connection_echo() {
    let (handle, thread, addr, inbound) = start(ReactorConfig::default(), |p| Recorder {
        echo: true,
        ..p
    });

    let (tx, outbound) = channel::unbounded();
    let recorder = Recorder {
        greeting: Some(b"hello reactor"),
        ..Recorder::new(tx)
    };
    handle.connect(addr, Box::new(recorder)).unwrap();

    match outbound.recv_timeout(WAIT).unwrap() {
        Observed::Established(info) => {
            assert_eq!(info.direction, Direction::Outbound);
            assert_eq!(info.peer_addr, addr);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(recv_data(&outbound, 13), b"hello reactor");

    match inbound.recv_timeout(WAIT).unwrap() {
        Observed::Established(info) => assert_eq!(info.direction, Direction::Inbound),
        other => panic!("unexpected event: {other:?}"),
    }

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_unreachable_peer_reports_error() {
    let closed = {
        let listener = StdListener::bind(localhost()).unwrap();
        listener.local_addr().unwrap()
    };

    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let handle = reactor.handle();
    let thread = reactor.spawn().unwrap();

    let (tx, rx) = channel::unbounded();
    handle.connect(closed, Box::new(Recorder::new(tx))).unwrap();

    match rx.recv_timeout(WAIT).unwrap() {
        Observed::Error { .. } => {}
        other => panic!("expected connect error, got {other:?}"),
    }
    // Exactly one terminal callback.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_idle_connection_times_out() {
    let config = ReactorConfig::default()
        .with_idle_timeout(Duration::from_millis(200))
        .with_select_timeout(Duration::from_millis(20));
    let (handle, thread, addr, rx) = start(config, |p| p);

    let mut client = StdStream::connect(addr).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Established(_)));
    match rx.recv_timeout(WAIT).unwrap() {
        Observed::Error { timeout, .. } => assert!(timeout),
        other => panic!("expected timeout, got {other:?}"),
    }

    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_peer_eof_disconnects() {
    let (handle, thread, addr, rx) = start(ReactorConfig::default(), |p| p);

    let mut client = StdStream::connect(addr).unwrap();
    client.write_all(b"bye").unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Established(_)));
    assert_eq!(recv_data(&rx, 3), b"bye");
    drop(client);

    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Disconnected));

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_rejecting_listener_closes_connection() {
    let (handle, thread, addr, rx) = start(ReactorConfig::default(), |p| Recorder {
        reject_data: true,
        ..p
    });

    let mut client = StdStream::connect(addr).unwrap();
    client.write_all(b"garbage").unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Established(_)));
    match rx.recv_timeout(WAIT).unwrap() {
        Observed::Error { rejected, .. } => assert!(rejected),
        other => panic!("expected rejection, got {other:?}"),
    }

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_close_flushes_and_disconnects() {
    let (handle, thread, addr, rx) = start(ReactorConfig::default(), |p| Recorder {
        greeting: Some(b"farewell"),
        ..p
    });

    let mut client = StdStream::connect(addr).unwrap();
    let id = match rx.recv_timeout(WAIT).unwrap() {
        Observed::Established(info) => info.id,
        other => panic!("unexpected event: {other:?}"),
    };
    handle.close(id).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Disconnected));

    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut received = Vec::new();
    client.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"farewell");

    handle.shutdown();
    thread.join().unwrap().unwrap();
}

#[test]
fn test_shutdown_disconnects_open_connections() {
    let (handle, thread, addr, rx) = start(ReactorConfig::default(), |p| p);

    let _client = StdStream::connect(addr).unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Established(_)));

    handle.shutdown();
    thread.join().unwrap().unwrap();
    assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Observed::Disconnected));
    assert!(matches!(handle.execute(|| {}), Err(ReactorError::Shutdown)));
}

#[test]
fn test_execute_runs_on_reactor_thread() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let handle = reactor.handle();
    let thread = reactor.spawn().unwrap();

    let (tx, rx) = channel::bounded(1);
    handle
        .execute(move || {
            let name = std::thread::current().name().map(str::to_owned);
            let _ = tx.send(name);
        })
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("reactor"));

    // A panicking task does not take the loop down.
    handle.execute(|| panic!("boom")).unwrap();
    let (tx, rx) = channel::bounded(1);
    handle.execute(move || tx.send(()).unwrap()).unwrap();
    assert!(rx.recv_timeout(WAIT).is_ok());

    handle.shutdown();
    thread.join().unwrap().unwrap();
}
