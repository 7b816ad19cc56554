//! Long-running kouncil tasks. Each holds only a weak reference and exits
//! once the overlay is gone.

use super::Kouncil;
use crate::address::Address;
use crate::overlay::Overlay;
use crate::peer::{LocalEvent, Peer, PeerEvent, RemotePeer};
use crate::rpc::Request;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

/// Mirror local stores and removals into the address book.
pub(super) async fn dispatch(kouncil: Weak<Kouncil>, mut events: broadcast::Receiver<LocalEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("missed {} local events, address book may lag", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(kouncil) = kouncil.upgrade() else {
            break;
        };
        match event {
            LocalEvent::Stored(address) => kouncil.record_local(address, true).await,
            LocalEvent::Removed(address) => kouncil.record_local(address, false).await,
        }
    }
}

/// Push newly stored addresses to every node connected to us, coalescing
/// whatever queued up since the last push.
pub(super) async fn broadcast(
    kouncil: Weak<Kouncil>,
    mut entries: mpsc::UnboundedReceiver<Address>,
    batch: usize,
) {
    while let Some(first) = entries.recv().await {
        let mut batched = BTreeSet::from([first]);
        while batched.len() < batch.max(1) {
            match entries.try_recv() {
                Ok(address) => {
                    batched.insert(address);
                }
                Err(_) => break,
            }
        }

        let Some(kouncil) = kouncil.upgrade() else {
            break;
        };
        tracing::trace!(
            "{}: broadcast {} new entries",
            kouncil.id().fmt_short(),
            batched.len()
        );
        kouncil
            .local
            .broadcast(Request::KouncilAddEntries { entries: batched })
            .await;
    }
}

/// Periodically ping disconnected peers. A successful ping reconnects
/// the peer, which brings it back through the connected path.
pub(super) async fn watch(kouncil: Weak<Kouncil>, interval: Duration, ceiling: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(kouncil) = kouncil.upgrade() else {
            break;
        };

        let now = Instant::now();
        let due: Vec<Arc<RemotePeer>> = {
            let mut guard = kouncil.state.lock().await;
            let state = &mut *guard;
            let mut due = Vec::new();
            for (id, remote) in state.peers.disconnected_remotes() {
                let Some(info) = state.infos.get_mut(id) else {
                    continue;
                };
                let since_seen = now.duration_since(info.last_seen);
                let since_attempt = now.duration_since(info.last_contact_attempt);
                if since_seen / 2 < since_attempt || since_attempt > ceiling {
                    tracing::trace!(
                        "{}: attempting to contact {}",
                        kouncil.id().fmt_short(),
                        id.fmt_short()
                    );
                    info.last_contact_attempt = now;
                    due.push(remote.clone());
                }
            }
            due
        };

        for remote in due {
            kouncil.perform("ping", async move {
                // Any answer, even "missing", proves the peer is back.
                let _ = remote.fetch(&Address::random()).await;
            });
        }
    }
}

/// Forward one remote peer's connection events to the overlay.
pub(super) async fn follow(
    kouncil: Weak<Kouncil>,
    remote: Weak<RemotePeer>,
    mut events: broadcast::Receiver<PeerEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        let (Some(kouncil), Some(remote)) = (kouncil.upgrade(), remote.upgrade()) else {
            break;
        };
        match event {
            PeerEvent::Connected => kouncil.peer_connected(&remote).await,
            PeerEvent::Disconnected => kouncil.peer_disconnected(&remote).await,
        }
    }
}
