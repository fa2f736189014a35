use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::ledger::Ledger;
use crate::ml::Classifier;
use crate::server::uploads::UploadStore;

/// プロセス内の予測カウンタ（永続化しない）
#[derive(Debug)]
pub struct PredictionCounter {
    start: u64,
    value: AtomicU64,
}

impl PredictionCounter {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            value: AtomicU64::new(start),
        }
    }

    /// 1増やし、増やした後の値を返す
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// 起動後に返した予測の数
    pub fn served(&self) -> u64 {
        self.current().saturating_sub(self.start)
    }
}

/// ハンドラ間で共有する状態
pub struct AppState {
    /// None ならモデル未読込（縮退動作）
    pub classifier: Option<Arc<dyn Classifier>>,
    /// None なら台帳無効
    pub ledger: Option<Arc<dyn Ledger>>,
    pub uploads: UploadStore,
    pub counter: PredictionCounter,
}

impl AppState {
    pub fn new(
        classifier: Option<Arc<dyn Classifier>>,
        ledger: Option<Arc<dyn Ledger>>,
        uploads: UploadStore,
        counter_start: u64,
    ) -> Self {
        Self {
            classifier,
            ledger,
            uploads,
            counter: PredictionCounter::new(counter_start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_configured_value() {
        let counter = PredictionCounter::new(1000);
        assert_eq!(counter.current(), 1000);
        assert_eq!(counter.increment(), 1001);
        assert_eq!(counter.increment(), 1002);
        assert_eq!(counter.served(), 2);
    }

    #[test]
    fn test_counter_is_shared_across_threads() {
        let counter = Arc::new(PredictionCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.current(), 800);
    }
}
