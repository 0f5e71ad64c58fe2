use crate::address::Address;
use crate::config::Config;
use crate::error::ErrorCode;
use crate::poll::backend::BackendKind;
use crate::service::Service;
use crate::tls::{RustlsEngine, TlsEngine};
use crate::transport::stream::{StreamKind, StreamTransport};
use crate::transport::tcp::TcpTransport;
use crate::transport::tcp_acceptor::TcpAcceptor;
use crate::transport::tcp_dialer::TcpDialer;
use crate::transport::tls::TlsTransport;
use crate::transport::tls_acceptor::TlsAcceptor;
use crate::transport::tls_dialer::TlsDialer;
use crate::transport::udp::UdpTransport;
use crate::transport::{
    AcceptorCallbacks, DialerCallbacks, ReadMode, TransportCallbacks, TransportState,
    UdpCallbacks,
};
use crossbeam_channel::{Receiver, Sender};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type TestResult = Result<(), Box<dyn Error>>;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Data(Vec<u8>),
    Disconnected,
    Stopped,
}

fn loopback() -> std::io::Result<Address> {
    Address::new("127.0.0.1", 0)
}

fn kinds() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Polling];
    #[cfg(unix)]
    kinds.push(BackendKind::Select);
    #[cfg(target_os = "linux")]
    kinds.push(BackendKind::Epoll);
    kinds
}

/// Run `scenario` once per backend, each time on a fresh service.
fn on_each_backend(scenario: impl Fn(&Arc<Service>) -> TestResult) -> TestResult {
    for kind in kinds() {
        let mut config = Config::default();
        _ = config.set_backend(kind);
        let service = Service::launch(config)?;
        scenario(&service).map_err(|e| format!("{kind}: {e}"))?;
        service.stop();
        service.wait_stopped();
    }
    Ok(())
}

fn echo<F: StreamKind>() -> TransportCallbacks<StreamTransport<F>> {
    TransportCallbacks::new(
        |transport: &Arc<StreamTransport<F>>, data: &[u8]| {
            _ = transport.send(data.to_vec());
        },
        |_: &Arc<StreamTransport<F>>| {},
        |_: &Arc<StreamTransport<F>>| {},
    )
}

fn observe<F: StreamKind>(tx: Sender<Seen>) -> TransportCallbacks<StreamTransport<F>> {
    let disconnected = tx.clone();
    let stopped = tx.clone();
    TransportCallbacks::new(
        move |_: &Arc<StreamTransport<F>>, data: &[u8]| {
            _ = tx.send(Seen::Data(data.to_vec()));
        },
        move |_: &Arc<StreamTransport<F>>| {
            _ = disconnected.send(Seen::Disconnected);
        },
        move |_: &Arc<StreamTransport<F>>| {
            _ = stopped.send(Seen::Stopped);
        },
    )
}

/// Gather delivered bytes until `len` arrived.
fn collect(rx: &Receiver<Seen>, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + WAIT;
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        match rx.recv_deadline(deadline) {
            Ok(Seen::Data(chunk)) => data.extend_from_slice(&chunk),
            Ok(other) => panic!("unexpected {other:?} after {} bytes", data.len()),
            Err(_) => panic!("only {} of {len} bytes arrived", data.len()),
        }
    }
    data
}

/// Skip data until `expected` shows up.
fn wait_for(rx: &Receiver<Seen>, expected: &Seen) {
    let deadline = Instant::now() + WAIT;
    loop {
        match rx.recv_deadline(deadline) {
            Ok(seen) if seen == *expected => return,
            Ok(_) => {}
            Err(_) => panic!("{expected:?} never happened"),
        }
    }
}

fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn tcp_echo_server(service: &Arc<Service>) -> Result<Arc<TcpAcceptor>, Box<dyn Error>> {
    let acceptor = TcpAcceptor::create(loopback()?);
    let weak = Arc::downgrade(service);
    acceptor.start(
        service,
        AcceptorCallbacks::new(
            move |_: &Arc<TcpAcceptor>, transport: Arc<TcpTransport>| {
                if let Some(service) = weak.upgrade() {
                    _ = transport.start(&service, ReadMode::Loop, echo());
                }
            },
            |_: &Arc<TcpAcceptor>| {},
        ),
    )?;
    assert_ne!(acceptor.get_local_address().port(), 0);
    Ok(acceptor)
}

/// A server that hands its accepted transports to the test.
fn tcp_parking_server(
    service: &Arc<Service>,
) -> Result<(Arc<TcpAcceptor>, Receiver<Arc<TcpTransport>>), Box<dyn Error>> {
    let acceptor = TcpAcceptor::create(loopback()?);
    let (tx, rx) = crossbeam_channel::unbounded();
    acceptor.start(
        service,
        AcceptorCallbacks::new(
            move |_: &Arc<TcpAcceptor>, transport: Arc<TcpTransport>| {
                _ = tx.send(transport);
            },
            |_: &Arc<TcpAcceptor>| {},
        ),
    )?;
    Ok((acceptor, rx))
}

fn tcp_client(
    service: &Arc<Service>,
    acceptor: &TcpAcceptor,
    mode: ReadMode,
) -> Result<(Arc<TcpTransport>, Receiver<Seen>), Box<dyn Error>> {
    let transport =
        TcpDialer::dial_sync(service, loopback()?, acceptor.get_local_address(), WAIT)
            .ok_or("dial failed")?;
    let (tx, rx) = crossbeam_channel::unbounded();
    transport.start(service, mode, observe(tx))?;
    Ok((transport, rx))
}

fn tls_engines() -> Result<(Arc<dyn TlsEngine>, Arc<dyn TlsEngine>), Box<dyn Error>> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
    let server = RustlsEngine::server_from_pem(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
    )?;
    let client = RustlsEngine::client_from_pem(certified.cert.pem().as_bytes(), "localhost")?;
    Ok((Arc::new(server), Arc::new(client)))
}

#[test]
fn tcp_echo_in_loop_mode() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        assert!(client.is_started());
        assert_eq!(client.get_read_mode(), Some(ReadMode::Loop));
        assert_eq!(client.get_remote_address(), acceptor.get_local_address());

        client.send(&b"hello"[..])?;
        client.send(&b" world"[..])?;
        assert_eq!(collect(&rx, 11), b"hello world");
        assert_eq!(client.read_continue(), Err(ErrorCode::Invalid));
        assert_eq!(client.send(Vec::new()), Err(ErrorCode::Invalid));
        Ok(())
    })
}

#[test]
fn large_payload_survives_partial_sends() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(64 * 1024) {
            client.send(chunk.to_vec())?;
        }
        assert_eq!(collect(&rx, payload.len()), payload);
        assert!(eventually(|| client.get_pending_send_size() == 0));
        Ok(())
    })
}

#[test]
fn once_mode_waits_for_read_continue() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Once)?;

        client.send(&b"a"[..])?;
        assert_eq!(collect(&rx, 1), b"a");
        client.send(&b"b"[..])?;
        assert!(rx.recv_timeout(QUIET).is_err());
        client.read_continue()?;
        assert_eq!(collect(&rx, 1), b"b");
        // armed with nothing to read
        client.read_continue()?;
        assert_eq!(client.read_continue(), Err(ErrorCode::Again));
        Ok(())
    })
}

#[test]
fn paused_transport_holds_reads_back() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        server.start(service, ReadMode::Loop, echo())?;

        client.pause()?;
        assert_eq!(client.get_state(), TransportState::Paused);
        assert_eq!(client.pause(), Err(ErrorCode::Invalid));
        server.send(&b"held"[..])?;
        assert!(rx.recv_timeout(QUIET).is_err());
        client.restart()?;
        assert_eq!(collect(&rx, 4), b"held");
        assert_eq!(client.restart(), Err(ErrorCode::Invalid));
        Ok(())
    })
}

#[test]
fn graceful_stop_sends_queued_data() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, client_rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        let (server_tx, server_rx) = crossbeam_channel::unbounded();
        server.start(service, ReadMode::Loop, observe(server_tx))?;

        let payload = vec![7u8; 2 * 1024 * 1024];
        client.send(payload.clone())?;
        client.stop();
        wait_for(&client_rx, &Seen::Stopped);
        assert_eq!(client.get_state(), TransportState::Stopped);
        assert_eq!(client.send(&b"late"[..]), Err(ErrorCode::Unstarted));

        assert_eq!(collect(&server_rx, payload.len()), payload);
        wait_for(&server_rx, &Seen::Disconnected);
        assert_eq!(server.get_state(), TransportState::Disconnected);
        Ok(())
    })
}

#[test]
fn force_stop_reports_stopped_once() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        client.force_stop();
        client.force_stop();
        client.stop();
        wait_for(&rx, &Seen::Stopped);
        assert!(rx.recv_timeout(QUIET).is_err());
        assert_eq!(client.get_state(), TransportState::Stopped);
        assert_eq!(client.get_pending_send_size(), 0);
        Ok(())
    })
}

#[test]
fn peer_close_disconnects() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, client_rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        let (server_tx, server_rx) = crossbeam_channel::unbounded();
        server.start(service, ReadMode::Loop, observe(server_tx))?;

        server.force_stop();
        wait_for(&server_rx, &Seen::Stopped);
        wait_for(&client_rx, &Seen::Disconnected);
        assert_eq!(client.get_state(), TransportState::Disconnected);
        assert_eq!(client.send(&b"gone"[..]), Err(ErrorCode::Unstarted));
        Ok(())
    })
}

#[test]
fn acceptor_lifecycle() -> TestResult {
    let idle = Service::new(Config::default())?;
    let acceptor = TcpAcceptor::create(loopback()?);
    let callbacks = || AcceptorCallbacks::new(|_: &Arc<TcpAcceptor>, _: Arc<TcpTransport>| {}, |_: &Arc<TcpAcceptor>| {});
    assert_eq!(acceptor.start(&idle, callbacks()), Err(ErrorCode::Unstarted));
    assert_eq!(acceptor.get_state(), TransportState::Error);

    let service = Service::launch(Config::default())?;
    let acceptor = TcpAcceptor::create(loopback()?);
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = stopped.clone();
    acceptor.start(
        &service,
        AcceptorCallbacks::new(
            |_: &Arc<TcpAcceptor>, _: Arc<TcpTransport>| {},
            move |_: &Arc<TcpAcceptor>| {
                _ = counter.fetch_add(1, Ordering::SeqCst);
            },
        ),
    )?;
    assert_eq!(acceptor.start(&service, callbacks()), Err(ErrorCode::Invalid));
    acceptor.stop();
    acceptor.stop();
    assert!(eventually(|| acceptor.get_state() == TransportState::Stopped));
    assert!(eventually(|| stopped.load(Ordering::SeqCst) == 1));
    assert!(service.registry().is_empty());
    Ok(())
}

#[test]
fn udp_round_trip() -> TestResult {
    on_each_backend(|service| {
        let (tx, rx) = crossbeam_channel::unbounded();
        let receiver = UdpTransport::create(loopback()?);
        receiver.start(
            service,
            ReadMode::Loop,
            UdpCallbacks::new(
                move |_: &Arc<UdpTransport>, data: &[u8], from: &Address| {
                    _ = tx.send((data.to_vec(), from.clone()));
                },
                |_: &Arc<UdpTransport>| {},
            ),
        )?;
        let (stopped_tx, stopped_rx) = crossbeam_channel::bounded(1);
        let sender = UdpTransport::create(loopback()?);
        sender.start(
            service,
            ReadMode::Once,
            UdpCallbacks::new(
                |_: &Arc<UdpTransport>, _: &[u8], _: &Address| {},
                move |_: &Arc<UdpTransport>| {
                    _ = stopped_tx.try_send(());
                },
            ),
        )?;
        assert_ne!(receiver.get_local_address().port(), 0);

        sender.send_to(b"ping", &receiver.get_local_address())?;
        sender.send_to(b"pong", &receiver.get_local_address())?;
        let (first, from) = rx.recv_timeout(WAIT)?;
        assert_eq!(first, b"ping");
        assert_eq!(from.port(), sender.get_local_address().port());
        assert_eq!(rx.recv_timeout(WAIT)?.0, b"pong");

        sender.stop();
        stopped_rx.recv_timeout(WAIT)?;
        assert_eq!(sender.get_state(), TransportState::Stopped);
        assert_eq!(
            sender.send_to(b"late", &receiver.get_local_address()),
            Err(ErrorCode::Unstarted)
        );
        Ok(())
    })
}

#[test]
fn tls_echo() -> TestResult {
    on_each_backend(|service| {
        let (server_engine, client_engine) = tls_engines()?;
        let acceptor = TlsAcceptor::create(loopback()?, server_engine, WAIT);
        let weak = Arc::downgrade(service);
        acceptor.start(
            service,
            AcceptorCallbacks::new(
                move |_: &Arc<TlsAcceptor>, transport: Arc<TlsTransport>| {
                    if let Some(service) = weak.upgrade() {
                        _ = transport.start(&service, ReadMode::Loop, echo());
                    }
                },
                |_: &Arc<TlsAcceptor>| {},
            ),
        )?;

        let client = TlsDialer::dial_sync(
            service,
            loopback()?,
            acceptor.get_local_address(),
            client_engine,
            WAIT,
        )
        .ok_or("tls dial failed")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        client.start(service, ReadMode::Loop, observe(tx))?;
        client.send(&b"secret"[..])?;
        assert_eq!(collect(&rx, 6), b"secret");

        let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 253) as u8).collect();
        client.send(payload.clone())?;
        assert_eq!(collect(&rx, payload.len()), payload);
        assert!(eventually(|| acceptor.handshaking_count() == 0));

        client.stop();
        wait_for(&rx, &Seen::Stopped);
        Ok(())
    })
}

#[test]
fn stalled_server_handshake_times_out() -> TestResult {
    on_each_backend(|service| {
        let (_, client_engine) = tls_engines()?;
        // accepts into the backlog and never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0")?;
        let remote = Address::new("127.0.0.1", silent.local_addr()?.port())?;

        let (tx, rx) = crossbeam_channel::bounded(2);
        let dialed = tx.clone();
        let dialer = TlsDialer::create(loopback()?, remote, client_engine, Duration::from_millis(200));
        dialer.start(
            service,
            DialerCallbacks::new(
                move |_: &Arc<TlsDialer>, _: Option<Arc<TlsTransport>>, _: bool| {
                    _ = dialed.try_send("dialed");
                },
                move |_: &Arc<TlsDialer>| {
                    _ = tx.try_send("timeouted");
                },
                |_: &Arc<TlsDialer>| {},
            ),
        )?;
        assert_eq!(rx.recv_timeout(WAIT)?, "timeouted");
        assert_eq!(dialer.get_state(), TransportState::Timeouted);
        Ok(())
    })
}

#[test]
fn silent_client_is_dropped_by_acceptor() -> TestResult {
    on_each_backend(|service| {
        let (server_engine, _) = tls_engines()?;
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let acceptor = TlsAcceptor::create(loopback()?, server_engine, Duration::from_millis(200));
        acceptor.start(
            service,
            AcceptorCallbacks::new(
                move |_: &Arc<TlsAcceptor>, _: Arc<TlsTransport>| {
                    _ = counter.fetch_add(1, Ordering::SeqCst);
                },
                |_: &Arc<TlsAcceptor>| {},
            ),
        )?;
        let _silent = std::net::TcpStream::connect(acceptor.get_local_address().socket_addr())?;
        assert!(eventually(|| acceptor.handshaking_count() == 1));
        assert!(eventually(|| acceptor.handshaking_count() == 0));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
        Ok(())
    })
}

#[test]
fn refused_dial_fails() -> TestResult {
    on_each_backend(|service| {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let remote = Address::new("127.0.0.1", port)?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let dialer = TcpDialer::create(loopback()?, remote.clone(), WAIT);
        dialer.start(
            service,
            DialerCallbacks::new(
                move |_: &Arc<TcpDialer>, transport: Option<Arc<TcpTransport>>, ok: bool| {
                    _ = tx.try_send((transport.is_some(), ok));
                },
                |_: &Arc<TcpDialer>| {},
                |_: &Arc<TcpDialer>| {},
            ),
        )?;
        assert_eq!(rx.recv_timeout(WAIT)?, (false, false));
        assert_eq!(dialer.get_state(), TransportState::Error);
        assert!(TcpDialer::dial_sync(service, loopback()?, remote, WAIT).is_none());
        Ok(())
    })
}

#[test]
fn stopped_dialer_reports_stopped() -> TestResult {
    on_each_backend(|service| {
        let (_, client_engine) = tls_engines()?;
        let silent = std::net::TcpListener::bind("127.0.0.1:0")?;
        let remote = Address::new("127.0.0.1", silent.local_addr()?.port())?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let dialer = TlsDialer::create(loopback()?, remote, client_engine, WAIT);
        dialer.start(
            service,
            DialerCallbacks::new(
                |_: &Arc<TlsDialer>, _: Option<Arc<TlsTransport>>, _: bool| {},
                |_: &Arc<TlsDialer>| {},
                move |_: &Arc<TlsDialer>| {
                    _ = tx.try_send(());
                },
            ),
        )?;
        dialer.stop();
        rx.recv_timeout(WAIT)?;
        assert_eq!(dialer.get_state(), TransportState::Stopped);
        assert!(eventually(|| service.registry().is_empty()));
        Ok(())
    })
}

#[test]
fn server_reads_ping() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, _) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        server.start(service, ReadMode::Loop, observe(tx))?;
        assert_eq!(server.get_remote_address(), client.get_local_address());

        client.send(&b"ping"[..])?;
        assert_eq!(collect(&rx, 4), b"ping");
        assert!(rx.recv_timeout(QUIET).is_err());
        Ok(())
    })
}

#[test]
fn queued_sends_keep_order() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, _) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        server.start(service, ReadMode::Loop, observe(tx))?;

        let mut expected = Vec::new();
        for (size, byte) in [(10, b'a'), (20, b'b'), (30, b'c')] {
            let buf = vec![byte; size];
            expected.extend_from_slice(&buf);
            client.send(buf)?;
        }
        assert_eq!(collect(&rx, 60), expected);
        assert!(rx.recv_timeout(QUIET).is_err());
        Ok(())
    })
}

#[test]
fn racing_stops_report_once() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        let (client, rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        client.send(vec![1u8; 64 * 1024])?;
        let stoppers: Vec<_> = (0..4)
            .map(|i| {
                let client = client.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        client.stop();
                    } else {
                        client.force_stop();
                    }
                })
            })
            .collect();
        for stopper in stoppers {
            stopper.join().expect("stopper thread");
        }
        wait_for(&rx, &Seen::Stopped);
        let deadline = Instant::now() + QUIET;
        while let Ok(seen) = rx.recv_deadline(deadline) {
            assert_ne!(seen, Seen::Stopped);
            assert_ne!(seen, Seen::Disconnected);
        }
        assert_eq!(client.get_state(), TransportState::Stopped);
        Ok(())
    })
}

#[test]
fn udp_sends_to_itself() -> TestResult {
    on_each_backend(|service| {
        let (tx, rx) = crossbeam_channel::unbounded();
        let transport = UdpTransport::create(loopback()?);
        transport.start(
            service,
            ReadMode::Loop,
            UdpCallbacks::new(
                move |_: &Arc<UdpTransport>, data: &[u8], from: &Address| {
                    _ = tx.send((data.to_vec(), from.clone()));
                },
                |_: &Arc<UdpTransport>| {},
            ),
        )?;
        let local = transport.get_local_address();
        transport.send_to(b"hello", &local)?;
        let (data, from) = rx.recv_timeout(WAIT)?;
        assert_eq!(data, b"hello");
        assert_eq!(from, local);
        Ok(())
    })
}

#[test]
fn racing_start_and_stop_report_stopped_once() -> TestResult {
    on_each_backend(|service| {
        let acceptor = tcp_echo_server(service)?;
        for _ in 0..20 {
            let transport =
                TcpDialer::dial_sync(service, loopback()?, acceptor.get_local_address(), WAIT)
                    .ok_or("dial failed")?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let stopper = {
                let transport = transport.clone();
                std::thread::spawn(move || transport.stop())
            };
            let started = transport.start(service, ReadMode::Loop, observe(tx));
            stopper.join().map_err(|_| "stopper thread panicked")?;
            // a stop that lost the race against start leaves it running
            transport.stop();
            if started.is_ok() {
                wait_for(&rx, &Seen::Stopped);
            }
            let deadline = Instant::now() + Duration::from_millis(50);
            while let Ok(seen) = rx.recv_deadline(deadline) {
                assert_ne!(seen, Seen::Stopped);
            }
            assert!(matches!(
                transport.get_state(),
                TransportState::Stopped | TransportState::Error
            ));
        }
        Ok(())
    })
}

#[test]
fn paused_udp_holds_datagrams_back() -> TestResult {
    on_each_backend(|service| {
        let (tx, rx) = crossbeam_channel::unbounded();
        let receiver = UdpTransport::create(loopback()?);
        receiver.start(
            service,
            ReadMode::Loop,
            UdpCallbacks::new(
                move |_: &Arc<UdpTransport>, data: &[u8], _: &Address| {
                    _ = tx.send(data.to_vec());
                },
                |_: &Arc<UdpTransport>| {},
            ),
        )?;
        assert_eq!(receiver.restart(), Err(ErrorCode::Invalid));
        receiver.pause()?;
        assert_eq!(receiver.get_state(), TransportState::Paused);
        assert_eq!(receiver.pause(), Err(ErrorCode::Invalid));

        let target = receiver.get_local_address();
        receiver.send_to(b"first", &target)?;
        receiver.send_to(b"second", &target)?;
        assert!(rx.recv_timeout(QUIET).is_err());

        receiver.restart()?;
        assert_eq!(rx.recv_timeout(WAIT)?, b"first");
        assert_eq!(rx.recv_timeout(WAIT)?, b"second");

        receiver.pause()?;
        receiver.stop();
        assert!(eventually(|| receiver.get_state() == TransportState::Stopped));
        Ok(())
    })
}

#[test]
fn short_dial_deadlines_always_report() -> TestResult {
    on_each_backend(|service| {
        let (_, client_engine) = tls_engines()?;
        // accepts into the backlog and never answers
        let silent = std::net::TcpListener::bind("127.0.0.1:0")?;
        let remote = Address::new("127.0.0.1", silent.local_addr()?.port())?;
        for _ in 0..10 {
            let (tx, rx) = crossbeam_channel::unbounded();
            let timeouted = tx.clone();
            let dialer = TlsDialer::create(
                loopback()?,
                remote.clone(),
                client_engine.clone(),
                Duration::from_millis(1),
            );
            dialer.start(
                service,
                DialerCallbacks::new(
                    move |_: &Arc<TlsDialer>, _: Option<Arc<TlsTransport>>, ok: bool| {
                        _ = tx.send(if ok { "dialed" } else { "failed" });
                    },
                    move |_: &Arc<TlsDialer>| {
                        _ = timeouted.send("timeouted");
                    },
                    |_: &Arc<TlsDialer>| {},
                ),
            )?;
            let outcome = rx.recv_timeout(WAIT)?;
            assert_ne!(outcome, "dialed");
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

            let (tx, rx) = crossbeam_channel::unbounded();
            let timeouted = tx.clone();
            let dialer = TcpDialer::create(loopback()?, remote.clone(), Duration::from_millis(1));
            dialer.start(
                service,
                DialerCallbacks::new(
                    move |_: &Arc<TcpDialer>, _: Option<Arc<TcpTransport>>, _: bool| {
                        _ = tx.send("dialed");
                    },
                    move |_: &Arc<TcpDialer>| {
                        _ = timeouted.send("timeouted");
                    },
                    |_: &Arc<TcpDialer>| {},
                ),
            )?;
            _ = rx.recv_timeout(WAIT)?;
            assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
            assert!(matches!(
                dialer.get_state(),
                TransportState::Finished | TransportState::Timeouted | TransportState::Error
            ));
        }
        Ok(())
    })
}

#[test]
fn sends_racing_stop_are_delivered_or_refused() -> TestResult {
    on_each_backend(|service| {
        let (acceptor, accepted) = tcp_parking_server(service)?;
        let (client, client_rx) = tcp_client(service, &acceptor, ReadMode::Loop)?;
        let server = accepted.recv_timeout(WAIT)?;
        let (server_tx, server_rx) = crossbeam_channel::unbounded();
        server.start(service, ReadMode::Loop, observe(server_tx))?;

        let senders: Vec<_> = (0..4)
            .map(|_| {
                let client = client.clone();
                std::thread::spawn(move || {
                    let mut sent = 0;
                    for _ in 0..2000 {
                        if client.send(vec![1u8; 512]).is_err() {
                            break;
                        }
                        sent += 512;
                    }
                    sent
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(2));
        client.stop();
        let mut sent = 0;
        for sender in senders {
            sent += sender.join().map_err(|_| "sender thread panicked")?;
        }
        wait_for(&client_rx, &Seen::Stopped);

        let mut received = 0;
        let deadline = Instant::now() + WAIT;
        loop {
            match server_rx.recv_deadline(deadline)? {
                Seen::Data(chunk) => received += chunk.len(),
                Seen::Disconnected => break,
                Seen::Stopped => return Err("server stopped on its own".into()),
            }
        }
        assert_eq!(received, sent);
        Ok(())
    })
}
