use super::TimeoutMode;
use crate::timeout::{TimeoutContext, TimeoutSettings};

/// Hands out the timeout context for each command a cursor sends.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct CursorTimeoutController {
    mode: TimeoutMode,
    settings: TimeoutSettings,
    /// Created when the cursor is opened. In `CursorLifetime` mode it bounds every fetch.
    lifetime: TimeoutContext,
}

impl CursorTimeoutController {
    pub(crate) fn new(settings: TimeoutSettings, mode: TimeoutMode) -> Self {
        Self {
            mode,
            settings,
            lifetime: settings.new_context(),
        }
    }

    pub(crate) fn mode(&self) -> TimeoutMode {
        self.mode
    }

    /// The context for the command that opens the cursor.
    pub(crate) fn open_context(&self) -> TimeoutContext {
        self.lifetime
    }

    /// The context for the next `getMore`.
    pub(crate) fn fetch_context(&self) -> TimeoutContext {
        match self.mode {
            TimeoutMode::CursorLifetime => self.lifetime,
            TimeoutMode::Iteration => self.lifetime.refreshed(),
        }
    }

    /// The context for the `killCursors` sent when the cursor is closed early.
    pub(crate) fn cleanup_context(&self) -> TimeoutContext {
        self.settings.cleanup_context()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::CursorTimeoutController;
    use crate::{cursor::TimeoutMode, timeout::TimeoutSettings};

    fn settings(budget_ms: u64) -> TimeoutSettings {
        TimeoutSettings {
            budget: Some(Duration::from_millis(budget_ms)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_lifetime_shares_one_deadline() {
        let controller = CursorTimeoutController::new(settings(100), TimeoutMode::CursorLifetime);
        let open = controller.open_context();

        tokio::time::advance(Duration::from_millis(60)).await;
        let fetch = controller.fetch_context();
        assert_eq!(fetch.deadline(), open.deadline());
        assert_eq!(
            fetch.remaining().unwrap(),
            Some(Duration::from_millis(40))
        );

        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(controller.fetch_context().remaining().unwrap_err().is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn iteration_restarts_the_budget_per_fetch() {
        let controller = CursorTimeoutController::new(settings(100), TimeoutMode::Iteration);

        tokio::time::advance(Duration::from_millis(250)).await;
        let fetch = controller.fetch_context();
        assert_eq!(
            fetch.remaining().unwrap(),
            Some(Duration::from_millis(100))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_uses_the_grace_budget() {
        let settings = TimeoutSettings {
            cleanup_grace: Some(Duration::from_millis(20)),
            ..settings(100)
        };
        let controller = CursorTimeoutController::new(settings, TimeoutMode::CursorLifetime);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(
            controller.cleanup_context().remaining().unwrap(),
            Some(Duration::from_millis(20))
        );
    }
}
