use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// 作业池范围的取消令牌。
///
/// ## 契约 (What)
/// - `cancel` 只在首次调用时返回 `true`，重复调用幂等；
/// - `child` 派生共享同一状态的令牌，任一克隆取消即全体可见；
/// - `cancelled().await` 在令牌被取消后完成，取消之前注册与之后注册的等待者都会被唤醒。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一取消状态的令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待取消信号。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记再检查标志，避免与 `cancel` 之间的唤醒丢失。
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
