//! The single-threaded `mio` event loop.
//!
//! One `Poll` instance multiplexes the listening socket and every live
//! egress socket; there is no thread pool and no locking in the hot
//! path. The only suspension point is `Poll::poll` itself.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Token};

use crate::dns::context::{Daemon, LISTENER_TOKEN};
use crate::dns::egress;
use crate::dns::errors::{DaemonError, Result};
use crate::dns::framing;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = framing::MAX_MESSAGE_LEN;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers for `SIGINT` and `SIGTERM` that flip a shared
/// shutdown flag; no other state is touched from signal context.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as usize);
        libc::signal(libc::SIGTERM, request_shutdown as usize);
    }
}

/// Drive `daemon` until a shutdown signal arrives.
pub fn run(mut daemon: Daemon) -> Result<()> {
    install_signal_handlers();

    let poll = mio::Poll::new().map_err(DaemonError::Io)?;
    poll.registry()
        .register(&mut daemon.listener, LISTENER_TOKEN, Interest::READABLE)
        .map_err(DaemonError::Io)?;

    let mut events = Events::with_capacity(256);
    let mut recv_buf = [0u8; MAX_DATAGRAM];

    log::info!("listening on {}", daemon.bind_address);

    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log::info!("shutdown signal received, exiting");
            return Ok(());
        }

        match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DaemonError::Io(e)),
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                drain_listener(&mut daemon, poll.registry(), &mut recv_buf);
            } else {
                drain_egress(&mut daemon, poll.registry(), event.token(), &mut recv_buf);
            }
        }

        run_timers(&mut daemon, poll.registry());
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn drain_listener(daemon: &mut Daemon, registry: &mio::Registry, buf: &mut [u8]) {
    loop {
        let (len, client_addr) = match daemon.listener.recv_from(buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::debug!("listener recv_from failed: {}", e);
                return;
            }
        };
        handle_client_query(daemon, registry, &buf[..len], client_addr);
    }
}

fn handle_client_query(daemon: &mut Daemon, registry: &mio::Registry, data: &[u8], client_addr: SocketAddr) {
    if framing::check_query(data).is_err() {
        log::debug!("dropping malformed query from {}", client_addr);
        return;
    }
    let client_qid = match framing::read_qid(data) {
        Ok(q) => q,
        Err(_) => return,
    };
    let qname = match framing::decode_qname(data, 12) {
        Ok(name) => name,
        Err(_) => {
            log::debug!("dropping query with unparsable qname from {}", client_addr);
            return;
        }
    };

    let when = now();
    let bypass_cache =
        daemon.ignore_inactive_cache_hits && daemon.dispatcher.would_hit_deactivated_server(&daemon.topology, &qname);

    if !bypass_cache {
        if let Ok(Some(mut cached)) = daemon.cache.lookup(data, when) {
            if framing::write_qid(&mut cached, client_qid).is_ok() {
                send_to_client(daemon, client_addr, &cached);
                return;
            }
        }
    }

    let mut buf = data.to_vec();
    let (slot, created) = match daemon.query_table.add_client(client_addr, client_qid, &mut buf, when, daemon.forward_timeout) {
        Ok(v) => v,
        Err(_) => {
            log::debug!("QID pool exhausted, dropping query from {}", client_addr);
            return;
        }
    };

    if !created {
        // A resend for an already-outstanding query: the fan-out was
        // already issued, nothing more to do until it resolves.
        return;
    }

    let sent = daemon.dispatcher.dispatch_client(
        slot,
        &qname,
        &buf,
        &mut daemon.query_table,
        &mut daemon.topology,
        &mut daemon.egress,
        registry,
        &mut daemon.sockets,
        daemon.retry_interval,
        when,
    );

    if !sent {
        if let Some(reply) = daemon.masterfile.master_dontknow(&buf) {
            let mut reply = reply;
            let _ = framing::write_qid(&mut reply, client_qid);
            send_to_client(daemon, client_addr, &reply);
        }
        if let Some(reclaimed) = daemon.query_table.delete(slot) {
            for token in reclaimed.egress_sockets {
                if let Some(socket) = daemon.sockets.remove(&token) {
                    daemon.egress.close(registry, socket);
                }
            }
        }
    }
}

fn drain_egress(daemon: &mut Daemon, registry: &mio::Registry, token: Token, buf: &mut [u8]) {
    loop {
        let fd = match daemon.sockets.get(&token) {
            Some(socket) => socket.socket.as_raw_fd(),
            None => return,
        };

        let received = match egress::recv_with_pktinfo(fd, buf) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::debug!("egress recv failed on {:?}: {}", token, e);
                return;
            }
        };

        let when = now();
        let deliver = crate::dns::correlator::handle_reply(
            token,
            &buf[..received.len],
            received.from,
            received.ingress_ifindex,
            &mut daemon.query_table,
            &mut daemon.topology,
            &mut daemon.egress,
            registry,
            &mut daemon.sockets,
            &daemon.cache,
            when,
        );

        if let Some((client_addr, reply)) = deliver {
            send_to_client(daemon, client_addr, &reply);
        }
    }
}

fn run_timers(daemon: &mut Daemon, registry: &mio::Registry) {
    let when = now();

    let deliveries = daemon.liveness.sweep_timeouts(
        when,
        daemon.retry_interval,
        &mut daemon.query_table,
        &mut daemon.topology,
        &mut daemon.egress,
        registry,
        &mut daemon.sockets,
    );
    for (client_addr, reply) in deliveries {
        send_to_client(daemon, client_addr, &reply);
    }

    daemon.liveness.retry_probe_sweep(
        when,
        daemon.retry_interval,
        &mut daemon.query_table,
        &mut daemon.topology,
        &daemon.dispatcher,
        &mut daemon.egress,
        registry,
        &mut daemon.sockets,
    );
}

fn send_to_client(daemon: &Daemon, client_addr: SocketAddr, reply: &[u8]) {
    if let Err(e) = daemon.listener.send_to(reply, client_addr) {
        log::debug!("send_to {} failed: {}", client_addr, e);
    }
}
