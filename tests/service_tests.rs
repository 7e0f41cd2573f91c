//! End-to-end tests driving a live service over loopback.

use lineserve::{Error, ErrorKind, Service, ServiceConfig, ServiceError};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn test_config() -> ServiceConfig {
    ServiceConfig::with_port(0)
        .host("127.0.0.1")
        .poll_timeout(Duration::from_millis(100))
}

fn uppercase(line: &str) -> Result<String, Error> {
    Ok(line.to_uppercase())
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
    }

    fn recv(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).unwrap();
        assert!(n > 0, "connection closed while waiting for a reply");
        assert!(line.ends_with('\n'), "reply not newline-terminated: {line:?}");
        line.pop();
        line
    }

    fn request(&mut self, line: &str) -> String {
        self.send(line);
        self.recv()
    }

    fn close_write(&self) {
        self.writer.shutdown(Shutdown::Write).unwrap();
    }

    /// True if the server closed the connection (EOF or reset).
    fn closed_by_peer(&mut self) -> bool {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ),
        }
    }
}

#[test]
fn test_uppercase_reply() {
    let service = Service::serve(test_config(), uppercase).unwrap();
    assert!(service.is_running());

    let mut client = Client::connect(service.local_addr());
    assert_eq!(client.request("hello"), "HELLO");
    assert_eq!(client.request("Mixed Case 123"), "MIXED CASE 123");
}

#[test]
fn test_convenience_constructor_listens_on_all_interfaces() {
    let service = Service::with_handler(0, uppercase).unwrap();
    let port = service.local_addr().port();
    assert_ne!(port, 0);

    let mut client = Client::connect(SocketAddr::from(([127, 0, 0, 1], port)));
    assert_eq!(client.request("hello"), "HELLO");
}

#[test]
fn test_concurrent_clients_get_ordered_replies() {
    let service = Service::serve(test_config(), uppercase).unwrap();
    let addr = service.local_addr();

    let workers: Vec<_> = (0..4)
        .map(|c| {
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                let lines: Vec<String> = (0..50).map(|i| format!("client{c}-line{i}")).collect();

                // Pipeline every line before reading any reply
                let mut batch = String::new();
                for line in &lines {
                    batch.push_str(line);
                    batch.push('\n');
                }
                client.send_raw(batch.as_bytes());

                for line in &lines {
                    assert_eq!(client.recv(), line.to_uppercase());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(service.is_running());
}

#[test]
fn test_crlf_terminator_is_stripped() {
    let service = Service::serve(test_config(), |line: &str| Ok(format!("[{line}]"))).unwrap();
    let mut client = Client::connect(service.local_addr());
    client.send_raw(b"hi\r\n");
    assert_eq!(client.recv(), "[hi]");
}

#[test]
fn test_clean_eof_removes_only_that_connection() {
    let service = Service::serve(test_config(), uppercase).unwrap();
    let mut a = Client::connect(service.local_addr());
    let mut b = Client::connect(service.local_addr());
    assert!(wait_until(|| service.connection_count() == 2));

    a.close_write();
    assert!(a.closed_by_peer());
    assert!(wait_until(|| service.connection_count() == 1));

    assert_eq!(b.request("still here"), "STILL HERE");
    assert_eq!(service.connection_count(), 1);
}

#[test]
fn test_unterminated_line_before_eof_is_answered() {
    let service = Service::serve(test_config(), uppercase).unwrap();
    let mut client = Client::connect(service.local_addr());

    client.send_raw(b"first\nlast");
    client.close_write();

    assert_eq!(client.recv(), "FIRST");
    assert_eq!(client.recv(), "LAST");
    assert!(client.closed_by_peer());
    assert!(wait_until(|| service.connection_count() == 0));
}

#[test]
fn test_registered_kind_recovers_and_drops_reply() {
    let service = Service::serve(test_config(), |line: &str| {
        if line == "boom" {
            Err(Error::application("flaky", "transient failure"))
        } else {
            Ok(line.to_uppercase())
        }
    })
    .unwrap();

    let recovered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&recovered);
    service.add_error_handler(ErrorKind::application("flaky"), move |err| {
        assert_eq!(err.kind(), &ErrorKind::application("flaky"));
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let mut client = Client::connect(service.local_addr());
    assert!(wait_until(|| service.connection_count() == 1));

    // No reply for "boom"; the next reply belongs to "ok"
    client.send("boom");
    assert_eq!(client.request("ok"), "OK");

    assert_eq!(recovered.load(Ordering::SeqCst), 1);
    assert!(service.is_running());
    assert_eq!(service.connection_count(), 1);
}

#[test]
fn test_protocol_violation_drops_only_offender() {
    let service = Service::serve(test_config(), |line: &str| {
        if line == "bad" {
            Err(Error::protocol_violation("bad command"))
        } else {
            Ok(line.to_uppercase())
        }
    })
    .unwrap();

    let mut a = Client::connect(service.local_addr());
    let mut b = Client::connect(service.local_addr());
    assert!(wait_until(|| service.connection_count() == 2));

    a.send("bad");
    assert!(a.closed_by_peer());
    assert!(wait_until(|| service.connection_count() == 1));

    assert_eq!(b.request("ping"), "PING");
    assert!(service.is_running());
}

#[test]
fn test_overlong_line_drops_connection() {
    let config = test_config().max_line_length(8);
    let service = Service::serve(config, uppercase).unwrap();
    let mut client = Client::connect(service.local_addr());

    client.send_raw(&[b'x'; 100]);
    assert!(client.closed_by_peer());
    assert!(wait_until(|| service.connection_count() == 0));
    assert!(service.is_running());
}

#[test]
fn test_unregistered_kind_is_fatal() {
    let mut service = Service::serve(test_config(), |line: &str| {
        if line == "die" {
            Err(Error::application("unknown", "no handler for this"))
        } else {
            Ok(line.to_uppercase())
        }
    })
    .unwrap();

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    service.set_fatal_observer(move |err| {
        sink.lock().unwrap().push(err.to_string());
    });

    let mut client = Client::connect(service.local_addr());
    assert_eq!(client.request("alive"), "ALIVE");
    client.send("die");

    assert!(wait_until(|| !service.is_running()));
    match service.join() {
        Err(ServiceError::Unhandled(err)) => {
            assert_eq!(err.kind(), &ErrorKind::application("unknown"));
        }
        other => panic!("unexpected join result: {other:?}"),
    }

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert!(observed[0].contains("no handler for this"));

    // Fatal shutdown leaves existing connections open until stop
    assert_eq!(service.connection_count(), 1);
    service.stop();
    assert_eq!(service.connection_count(), 0);
    assert!(client.closed_by_peer());
}

#[test]
fn test_start_after_fatal_serves_parked_connections() {
    let mut service = Service::serve(test_config(), |line: &str| {
        if line == "die" {
            Err(Error::application("unknown", "no handler for this"))
        } else {
            Ok(line.to_uppercase())
        }
    })
    .unwrap();

    let mut client = Client::connect(service.local_addr());
    client.send_raw(b"die\nhello\n");

    assert!(wait_until(|| !service.is_running()));
    assert!(matches!(service.join(), Err(ServiceError::Unhandled(_))));
    assert_eq!(service.connection_count(), 1);

    service.start().unwrap();
    assert!(service.is_running());
    assert_eq!(service.connection_count(), 1);

    // The line buffered behind the fatal one is answered after restart
    assert_eq!(client.recv(), "HELLO");
    assert_eq!(client.request("again"), "AGAIN");

    let mut late = Client::connect(service.local_addr());
    assert_eq!(late.request("new"), "NEW");
    assert!(wait_until(|| service.connection_count() == 2));
}

#[test]
fn test_stop_racing_fatal_exit_closes_connections() {
    let mut service = Service::serve(test_config(), |line: &str| {
        if line == "die" {
            Err(Error::application("unknown", "no handler for this"))
        } else {
            Ok(line.to_uppercase())
        }
    })
    .unwrap();

    let mut client = Client::connect(service.local_addr());
    assert_eq!(client.request("alive"), "ALIVE");
    client.send("die");
    service.stop();

    // Either outcome is fine; the connection must be gone after join
    let _ = service.join();
    assert!(!service.is_running());
    assert_eq!(service.connection_count(), 0);
    assert!(client.closed_by_peer());
}

#[test]
fn test_handler_panic_reaches_fatal_observer() {
    let mut service = Service::serve(test_config(), |line: &str| {
        if line == "panic" {
            panic!("handler gave up");
        }
        Ok(line.to_uppercase())
    })
    .unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&observed);
    service.set_fatal_observer(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
    });

    let mut offender = Client::connect(service.local_addr());
    let mut bystander = Client::connect(service.local_addr());
    assert_eq!(bystander.request("before"), "BEFORE");
    assert!(wait_until(|| service.connection_count() == 2));

    offender.send("panic");
    assert!(wait_until(|| !service.is_running()));
    match service.join() {
        Err(ServiceError::Unhandled(err)) => {
            assert_eq!(err.kind(), &ErrorKind::HandlerPanic);
            assert_eq!(err.message(), "handler gave up");
        }
        other => panic!("unexpected join result: {other:?}"),
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    // Nobody was disconnected; the bystander is served after a restart
    assert_eq!(service.connection_count(), 2);
    service.start().unwrap();
    assert_eq!(bystander.request("after"), "AFTER");
}

#[test]
fn test_handler_panic_recovers_with_callback() {
    let service = Service::serve(test_config(), |line: &str| {
        if line == "panic" {
            panic!("handler gave up");
        }
        Ok(line.to_uppercase())
    })
    .unwrap();
    service.add_error_handler(ErrorKind::HandlerPanic, |_| {});

    let mut client = Client::connect(service.local_addr());
    client.send("panic");
    assert_eq!(client.request("next"), "NEXT");
    assert!(service.is_running());
}

#[test]
fn test_reset_drops_only_that_connection() {
    let service = Service::serve(test_config(), uppercase).unwrap();
    let a = Client::connect(service.local_addr());
    let mut b = Client::connect(service.local_addr());
    assert!(wait_until(|| service.connection_count() == 2));

    // Linger of zero turns close into a reset
    socket2::SockRef::from(&a.writer)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(a);

    assert!(wait_until(|| service.connection_count() == 1));
    assert!(service.is_running());
    assert_eq!(b.request("ping"), "PING");
}

#[test]
fn test_endless_line_is_cut_off() {
    let config = test_config().max_line_length(1024);
    let service = Service::serve(config, uppercase).unwrap();
    let mut client = Client::connect(service.local_addr());
    assert!(wait_until(|| service.connection_count() == 1));

    let mut writer = client.writer.try_clone().unwrap();
    let flood = thread::spawn(move || {
        let chunk = [b'x'; 64 * 1024];
        // Ends with an error once the server drops us
        for _ in 0..1024 {
            if writer.write_all(&chunk).is_err() {
                break;
            }
        }
    });

    assert!(client.closed_by_peer());
    assert!(wait_until(|| service.connection_count() == 0));
    assert!(service.is_running());
    flood.join().unwrap();
}

#[test]
fn test_stop_and_join_are_bounded() {
    let mut service = Service::serve(test_config(), uppercase).unwrap();
    let addr = service.local_addr();
    let mut client = Client::connect(addr);
    assert_eq!(client.request("before"), "BEFORE");

    let started = Instant::now();
    service.stop();
    service.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(!service.is_running());
    assert_eq!(service.connection_count(), 0);

    // Connections were closed and the listener is gone
    assert!(client.closed_by_peer());
    assert!(TcpStream::connect(addr).is_err());

    // Idempotent
    service.stop();
    service.join().unwrap();
}

#[test]
fn test_restart_serves_on_same_address() {
    let mut service = Service::serve(test_config(), uppercase).unwrap();
    let addr = service.local_addr();

    service.stop();
    service.join().unwrap();

    service.start().unwrap();
    assert!(service.is_running());
    assert_eq!(service.local_addr(), addr);

    let mut client = Client::connect(addr);
    assert_eq!(client.request("again"), "AGAIN");
}

#[test]
fn test_start_is_noop_while_running() {
    let mut service = Service::serve(test_config(), uppercase).unwrap();
    service.start().unwrap();
    let mut client = Client::connect(service.local_addr());
    assert_eq!(client.request("once"), "ONCE");
}

#[test]
fn test_handler_can_be_unset_and_replaced() {
    let mut service = Service::bind(test_config()).unwrap();
    assert!(!service.is_running());
    service.start().unwrap();

    let mut client = Client::connect(service.local_addr());
    assert_eq!(client.request("anything"), "");

    service.set_message_handler(uppercase);
    assert_eq!(client.request("now"), "NOW");

    service.set_message_handler(|line: &str| Ok(line.len().to_string()));
    assert_eq!(client.request("four"), "4");

    service.clear_message_handler();
    assert_eq!(client.request("gone"), "");
}

#[test]
fn test_remove_error_handler_restores_fatal_path() {
    let mut service = Service::serve(test_config(), |line: &str| {
        Err(Error::application("flaky", line.to_string()))
    })
    .unwrap();

    let kind = ErrorKind::application("flaky");
    service.add_error_handler(kind.clone(), |_| {});
    let mut client = Client::connect(service.local_addr());
    client.send("first");
    // Recovered: no reply, still running
    thread::sleep(Duration::from_millis(200));
    assert!(service.is_running());

    assert!(service.remove_error_handler(&kind));
    assert!(!service.remove_error_handler(&kind));
    client.send("second");
    assert!(wait_until(|| !service.is_running()));
    assert!(matches!(service.join(), Err(ServiceError::Unhandled(_))));
}

#[test]
fn test_bind_conflict_fails_fast() {
    let service = Service::bind(test_config()).unwrap();
    let taken = ServiceConfig::with_port(service.local_addr().port()).host("127.0.0.1");
    assert!(matches!(
        Service::bind(taken),
        Err(ServiceError::Bind { .. })
    ));
}
