//! Latest-value-wins hand-off between workers and the consumer.
//!
//! Each tile owns a single-slot channel: a send replaces whatever the
//! consumer has not read yet and never blocks the producer. A slow
//! consumer simply observes the newest frame when it gets around to it.

use quadview_types::RasterFrame;
use tokio::sync::watch;

pub type FrameSender = watch::Sender<Option<RasterFrame>>;
pub type FrameReceiver = watch::Receiver<Option<RasterFrame>>;

/// Creates an empty tile mailbox.
pub fn frame_mailbox() -> (FrameSender, FrameReceiver) {
    watch::channel(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn raster(tag: u8) -> RasterFrame {
        RasterFrame {
            width: 1,
            height: 1,
            data: Bytes::from(vec![tag, 0, 0, 255]),
        }
    }

    #[tokio::test]
    async fn consumer_sees_only_the_newest_frame() {
        let (tx, mut rx) = frame_mailbox();
        tx.send_replace(Some(raster(1)));
        tx.send_replace(Some(raster(2)));
        tx.send_replace(Some(raster(3)));

        rx.changed().await.expect("sender alive");
        let seen = rx.borrow_and_update().clone().expect("frame present");
        assert_eq!(seen.data[0], 3);
    }

    #[test]
    fn send_without_receiver_never_blocks() {
        let (tx, rx) = frame_mailbox();
        drop(rx);
        tx.send_replace(Some(raster(9)));
        tx.send_replace(Some(raster(10)));
    }
}
