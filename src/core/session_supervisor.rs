//! 会话监管：同一会话的 turn 串行执行
//!
//! 每个会话一把异步锁；不同会话的 turn 互不阻塞。turn 任务持有 owned guard 直到结束。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    locks: Mutex<HashMap<String, Arc<TurnLock<()>>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, session_id: &str) -> Arc<TurnLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(TurnLock::new(())))
            .clone()
    }

    /// 等待该会话上一个 turn 结束后取得执行权
    pub async fn lock_turn(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(session_id).lock_owned().await
    }

    /// 当前是否有 turn 在执行
    pub fn is_busy(&self, session_id: &str) -> bool {
        let locks = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .get(session_id)
            .map(|l| l.try_lock().is_err())
            .unwrap_or(false)
    }

    /// 会话结束时移除锁。仍有 turn 持有或排队等待时保留，
    /// 之后的 turn 继续排在同一把锁后面
    pub fn remove(&self, session_id: &str) -> bool {
        let mut locks = match self.locks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let idle = locks
            .get(session_id)
            .map(|l| Arc::strong_count(l) == 1)
            .unwrap_or(false);
        if idle {
            locks.remove(session_id);
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_serialized() {
        let sup = Arc::new(SessionSupervisor::new());
        let guard = sup.lock_turn("s1").await;
        assert!(sup.is_busy("s1"));
        assert!(!sup.is_busy("s2"));

        let sup2 = sup.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup2.lock_turn("s1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert!(!sup.is_busy("s1"));
    }

    #[tokio::test]
    async fn test_remove_keeps_lock_while_turn_is_queued() {
        let sup = Arc::new(SessionSupervisor::new());
        let guard = sup.lock_turn("s1").await;

        let sup2 = sup.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup2.lock_turn("s1").await;
            tokio::time::sleep(Duration::from_millis(150)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(!sup.remove("s1"));

        // 新 turn 仍排在等待中的 turn 之后
        let next = tokio::time::timeout(Duration::from_millis(50), sup.lock_turn("s1")).await;
        assert!(next.is_err());

        waiter.await.unwrap();
        assert!(sup.remove("s1"));
        assert!(!sup.is_busy("s1"));
    }

    #[tokio::test]
    async fn test_distinct_sessions_independent() {
        let sup = SessionSupervisor::new();
        let _a = sup.lock_turn("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), sup.lock_turn("b"))
            .await
            .expect("other session must not block");
    }
}
