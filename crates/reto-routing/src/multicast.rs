//! Fan-out link for multicast routed connections
//!
//! A multicast connection still holds exactly one packet connection; the
//! fan-out to the first-hop children lives below it as a link that sends
//! every frame to all children and merges their inbound events into one
//! stream. The first child to go down takes the whole fan-out down, which
//! hands recovery to the reliability layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use reto_transport::link::{Link, LinkChannel, LinkError, LinkEvent};

const EVENT_BUFFER: usize = 64;

/// Merge child links into one logical link
///
/// A single child passes through untouched.
pub fn multicast_channel(mut children: Vec<LinkChannel>) -> LinkChannel {
    if children.len() == 1 {
        return children.remove(0);
    }

    let (merged_tx, merged_rx) = mpsc::channel(EVENT_BUFFER);
    let down = Arc::new(AtomicBool::new(false));

    let mut links = Vec::with_capacity(children.len());
    for child in children {
        let LinkChannel { link, mut events } = child;
        links.push(link);

        let merged_tx = merged_tx.clone();
        let down = Arc::clone(&down);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Some(event) => event,
                    None => LinkEvent::Closed(Some(LinkError::ClosedByPeer)),
                };
                match event {
                    LinkEvent::Message(frame) => {
                        if merged_tx.send(LinkEvent::Message(frame)).await.is_err() {
                            return;
                        }
                    }
                    LinkEvent::Closed(error) => {
                        // first child down closes the whole fan-out
                        if !down.swap(true, Ordering::SeqCst) {
                            debug!(?error, "multicast child link went down");
                            let _ = merged_tx.send(LinkEvent::Closed(error)).await;
                        }
                        return;
                    }
                }
            }
        });
    }

    let link = Arc::new(MulticastLink {
        children: links,
        down,
    });
    LinkChannel::new(link, merged_rx)
}

struct MulticastLink {
    children: Vec<Arc<dyn Link>>,
    down: Arc<AtomicBool>,
}

#[async_trait]
impl Link for MulticastLink {
    async fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(LinkError::ClosedByPeer);
        }
        for child in &self.children {
            child.send(frame.clone()).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        for child in &self.children {
            child.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reto_transport::memory::memory_link_pair;

    #[tokio::test]
    async fn test_send_reaches_all_children() {
        let (child_a, mut remote_a) = memory_link_pair();
        let (child_b, mut remote_b) = memory_link_pair();
        let merged = multicast_channel(vec![child_a, child_b]);

        merged.link.send(Bytes::from_static(b"frame")).await.unwrap();

        for remote in [&mut remote_a, &mut remote_b] {
            match remote.events.recv().await.unwrap() {
                LinkEvent::Message(frame) => assert_eq!(&frame[..], b"frame"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_inbound_events_are_merged() {
        let (child_a, remote_a) = memory_link_pair();
        let (child_b, remote_b) = memory_link_pair();
        let mut merged = multicast_channel(vec![child_a, child_b]);

        remote_a.link.send(Bytes::from_static(b"a")).await.unwrap();
        remote_b.link.send(Bytes::from_static(b"b")).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            match merged.events.recv().await.unwrap() {
                LinkEvent::Message(frame) => seen.push(frame),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn test_one_child_down_closes_fanout() {
        let (child_a, remote_a) = memory_link_pair();
        let (child_b, _remote_b) = memory_link_pair();
        let mut merged = multicast_channel(vec![child_a, child_b]);

        remote_a.link.close().await;

        loop {
            match merged.events.recv().await.unwrap() {
                LinkEvent::Closed(_) => break,
                LinkEvent::Message(_) => {}
            }
        }
        assert!(merged.link.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_single_child_passes_through() {
        let (child, mut remote) = memory_link_pair();
        let merged = multicast_channel(vec![child]);

        merged.link.send(Bytes::from_static(b"solo")).await.unwrap();
        match remote.events.recv().await.unwrap() {
            LinkEvent::Message(frame) => assert_eq!(&frame[..], b"solo"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
