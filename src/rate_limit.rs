//! PIN Rate Limiter
//! プロセス内スライディングウィンドウ制限（プロセス再起動で消える前提の advisory 制御）

use std::collections::HashMap;
use std::sync::Mutex;

/// 試行ウィンドウ（15分）
const ATTEMPT_WINDOW_MS: i64 = 15 * 60 * 1000;
/// ウィンドウ内の最大試行回数
const MAX_ATTEMPTS: u32 = 5;
/// ロック時間（30分）
const LOCK_DURATION_MS: i64 = 30 * 60 * 1000;

/// 判定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinDecision {
    Allowed,
    Denied { locked_until_ms: i64 },
}

#[derive(Debug)]
struct PinWindow {
    attempts: u32,
    last_attempt_ms: i64,
    locked_until_ms: Option<i64>,
}

/// PIN 検証用レートリミッタ
/// main で1個だけ構築して AppState 経由でハンドラに渡す
#[derive(Debug, Default)]
pub struct PinRateLimiter {
    windows: Mutex<HashMap<String, PinWindow>>,
}

impl PinRateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 現在時刻で判定
    pub fn check(&self, key: &str) -> PinDecision {
        self.check_at(key, chrono::Utc::now().timestamp_millis())
    }

    /// 指定時刻で判定
    pub fn check_at(&self, key: &str, now_ms: i64) -> PinDecision {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let window = windows.entry(key.to_string()).or_insert(PinWindow {
            attempts: 0,
            last_attempt_ms: now_ms,
            locked_until_ms: None,
        });

        // ロック中は残り時間つきで拒否
        if let Some(locked_until) = window.locked_until_ms {
            if locked_until > now_ms {
                return PinDecision::Denied {
                    locked_until_ms: locked_until,
                };
            }
        }

        // ウィンドウ経過でリセット
        if window.attempts > 0 && now_ms - window.last_attempt_ms >= ATTEMPT_WINDOW_MS {
            window.attempts = 1;
            window.last_attempt_ms = now_ms;
            window.locked_until_ms = None;
            return PinDecision::Allowed;
        }

        window.attempts += 1;
        window.last_attempt_ms = now_ms;

        if window.attempts >= MAX_ATTEMPTS {
            let locked_until = now_ms + LOCK_DURATION_MS;
            window.locked_until_ms = Some(locked_until);
            return PinDecision::Denied {
                locked_until_ms: locked_until,
            };
        }

        PinDecision::Allowed
    }

    /// 検証成功時に状態を破棄する
    pub fn clear(&self, key: &str) {
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        windows.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn allows_first_four_attempts_then_locks_on_fifth() {
        let limiter = PinRateLimiter::new();

        for i in 0..4 {
            assert_eq!(
                limiter.check_at("user-1", T0 + i * 1000),
                PinDecision::Allowed,
                "attempt {} should be allowed",
                i + 1
            );
        }

        let fifth = limiter.check_at("user-1", T0 + 4000);
        let locked_until = match fifth {
            PinDecision::Denied { locked_until_ms } => locked_until_ms,
            PinDecision::Allowed => panic!("fifth attempt should be denied"),
        };
        assert_eq!(locked_until, T0 + 4000 + LOCK_DURATION_MS);

        // 6回目はロック中、5回目と同じ locked_until
        assert_eq!(
            limiter.check_at("user-1", T0 + 60_000),
            PinDecision::Denied {
                locked_until_ms: locked_until
            }
        );
    }

    #[test]
    fn window_elapse_resets_attempt_counter() {
        let limiter = PinRateLimiter::new();

        assert_eq!(limiter.check_at("user-2", T0), PinDecision::Allowed);
        assert_eq!(limiter.check_at("user-2", T0 + 1000), PinDecision::Allowed);

        // 15分経過でカウンタは1に戻る
        let later = T0 + 1000 + ATTEMPT_WINDOW_MS;
        assert_eq!(limiter.check_at("user-2", later), PinDecision::Allowed);

        // リセット後なので、さらに3回は許可され、5回目相当で初めて拒否
        assert_eq!(limiter.check_at("user-2", later + 1000), PinDecision::Allowed);
        assert_eq!(limiter.check_at("user-2", later + 2000), PinDecision::Allowed);
        assert_eq!(limiter.check_at("user-2", later + 3000), PinDecision::Allowed);
        assert!(matches!(
            limiter.check_at("user-2", later + 4000),
            PinDecision::Denied { .. }
        ));
    }

    #[test]
    fn lock_expires_after_lock_duration() {
        let limiter = PinRateLimiter::new();

        for i in 0..5 {
            limiter.check_at("user-3", T0 + i * 1000);
        }
        assert!(matches!(
            limiter.check_at("user-3", T0 + 10_000),
            PinDecision::Denied { .. }
        ));

        // ロック満了後は試行ウィンドウも経過しているのでリセットされて許可
        let after_lock = T0 + 4000 + LOCK_DURATION_MS + 1;
        assert_eq!(limiter.check_at("user-3", after_lock), PinDecision::Allowed);
    }

    #[test]
    fn clear_forgets_subject_state() {
        let limiter = PinRateLimiter::new();

        for i in 0..5 {
            limiter.check_at("user-4", T0 + i * 1000);
        }
        limiter.clear("user-4");
        assert_eq!(limiter.check_at("user-4", T0 + 10_000), PinDecision::Allowed);
    }

    #[test]
    fn subjects_are_independent() {
        let limiter = PinRateLimiter::new();

        for i in 0..5 {
            limiter.check_at("user-5", T0 + i * 1000);
        }
        assert_eq!(limiter.check_at("other", T0 + 10_000), PinDecision::Allowed);
    }
}
