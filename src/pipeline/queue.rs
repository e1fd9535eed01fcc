//! Per-camera image hand-off between the delivery callback and consumers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};

use crate::capture::frame::Image;

/// Unbounded FIFO of decoded images.
///
/// Pushing never blocks. Popping blocks until an image arrives or the queue
/// is closed and drained.
pub struct ImageQueue {
    tx: ArcSwapOption<Sender<Image>>,
    rx: Receiver<Image>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    images_written: AtomicUsize,
    images_read: AtomicUsize,
}

impl ImageQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx: ArcSwapOption::from_pointee(tx),
            rx,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: append an image. Returns false once the queue is closed.
    pub fn push(&self, image: Image) -> bool {
        let guard = self.tx.load();
        let Some(tx) = &*guard else {
            return false;
        };
        if tx.send(image).is_err() {
            return false;
        }
        self.stats.images_written.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Consumer: remove the oldest image, waiting for one if necessary.
    /// `None` once closed and drained.
    pub fn pop(&self) -> Option<Image> {
        let image = self.rx.recv().ok()?;
        self.count_read();
        Some(image)
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<Image> {
        match self.rx.recv_timeout(timeout) {
            Ok(image) => {
                self.count_read();
                Some(image)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub async fn pop_async(&self) -> Option<Image> {
        let image = self.rx.recv_async().await.ok()?;
        self.count_read();
        Some(image)
    }

    pub fn try_pop(&self) -> Option<Image> {
        let image = self.rx.try_recv().ok()?;
        self.count_read();
        Some(image)
    }

    /// Discard everything pending, returning how many images were dropped
    pub fn clear(&self) -> usize {
        self.rx.drain().count()
    }

    /// Stop accepting images and wake blocked consumers once drained
    pub fn close(&self) {
        self.tx.store(None);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.load().is_none()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// (written, read)
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.images_written.load(Ordering::Relaxed),
            self.stats.images_read.load(Ordering::Relaxed),
        )
    }

    fn count_read(&self) {
        self.stats.images_read.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ImageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use std::sync::Arc;
    use std::thread;

    fn image(id: u64) -> Image {
        Image::new(GrayImage::from_pixel(2, 2, Luma([id as u8])), id, id * 10)
    }

    #[test]
    fn pops_in_push_order() {
        let queue = ImageQueue::new();
        for id in 1..=4 {
            assert!(queue.push(image(id)));
        }
        assert_eq!(queue.len(), 4);
        let ids: Vec<u64> = (0..4).filter_map(|_| queue.pop()).map(|i| i.frame_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(queue.stats(), (4, 4));
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(ImageQueue::new());
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(image(9));
            })
        };
        assert_eq!(queue.pop().map(|i| i.frame_id()), Some(9));
        producer.join().unwrap();
    }

    #[test]
    fn close_drains_then_releases_consumers() {
        let queue = Arc::new(ImageQueue::new());
        queue.push(image(1));
        queue.close();
        assert!(!queue.push(image(2)));
        assert!(queue.is_closed());
        assert_eq!(queue.pop().map(|i| i.frame_id()), Some(1));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn timeout_and_try_pop_on_empty_queue() {
        let queue = ImageQueue::new();
        assert!(queue.try_pop().is_none());
        assert!(queue.pop_timeout(Duration::from_millis(5)).is_none());
        queue.push(image(3));
        queue.push(image(4));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn async_pop() {
        let queue = Arc::new(ImageQueue::new());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            producer.push(image(7));
        });
        assert_eq!(queue.pop_async().await.map(|i| i.frame_id()), Some(7));
    }
}
