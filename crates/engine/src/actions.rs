//! Dispatch of widget actions to a host-side executor
//!
//! Widgets emit [`ActionRequest`]s mid-call; something on the host has to
//! perform them and, for the round-trip kinds, feed the result back so the
//! blocked widget resumes. [`ActionRouter`] drains the runner's action
//! stream and dispatches each request to an [`ActionExecutor`]
//! implementation, serially and in arrival order.

use std::future::Future;
use std::sync::Arc;

use widgeon_protocol::{ActionRequest, Screenshot, ViewerRelationship};

use crate::runner::SupervisedTaskRunner;

/// Host capabilities a widget can invoke.
///
/// The fire-and-forget methods report success only for logging; the
/// round-trip methods produce the value the widget is blocked on. Returning
/// `None` from a capture resolves the widget with `null`.
pub trait ActionExecutor: Send + Sync + 'static {
    fn send_message(&self, text: String) -> impl Future<Output = bool> + Send;

    fn delete_message(&self, message_id: String) -> impl Future<Output = bool> + Send;

    fn ban_user(
        &self,
        login: String,
        expires_in: String,
        reason: String,
    ) -> impl Future<Output = bool> + Send;

    fn capture_screenshot(&self, format: String)
        -> impl Future<Output = Option<Screenshot>> + Send;

    fn relationship(
        &self,
        viewer: String,
        channel: String,
    ) -> impl Future<Output = Option<ViewerRelationship>> + Send;

    fn play_audio(&self, url: String) -> impl Future<Output = bool> + Send;
}

/// Bridges a runner's action stream to an executor
pub struct ActionRouter<E> {
    executor: Arc<E>,
    runner: SupervisedTaskRunner,
}

impl<E: ActionExecutor> ActionRouter<E> {
    pub fn new(executor: Arc<E>, runner: SupervisedTaskRunner) -> Self {
        Self { executor, runner }
    }

    /// Drain actions until the runner is dropped
    pub async fn run(self) {
        let mut actions = self.runner.subscribe_actions();
        while let Some(action) = actions.recv().await {
            self.dispatch(action).await;
        }
    }

    async fn dispatch(&self, action: ActionRequest) {
        match action {
            ActionRequest::SendMessage { text } => {
                if !self.executor.send_message(text).await {
                    tracing::debug!("sendMessage was not delivered");
                }
            }
            ActionRequest::DeleteMessage { message_id } => {
                if !self.executor.delete_message(message_id).await {
                    tracing::debug!("deleteMessage was not delivered");
                }
            }
            ActionRequest::BanUser {
                login,
                expires_in,
                reason,
            } => {
                if !self.executor.ban_user(login, expires_in, reason).await {
                    tracing::debug!("banUser was not delivered");
                }
            }
            ActionRequest::CaptureScreenshot { format } => {
                let screenshot = self
                    .executor
                    .capture_screenshot(format)
                    .await
                    .unwrap_or_default();
                self.runner.resolve_screenshot(screenshot);
            }
            ActionRequest::Relationship { viewer, channel } => {
                let relationship = self
                    .executor
                    .relationship(viewer.clone(), channel.clone())
                    .await;
                self.runner.resolve_relationship(viewer, channel, relationship);
            }
            ActionRequest::PlayAudio { request_id, url } => {
                let success = self.executor.play_audio(url).await;
                self.runner.resolve_audio(request_id, success);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use widgeon_protocol::{FunctionSpec, SubscriptionInfo};
    use widgeon_sandbox::MessageLog;

    use crate::runner::RunnerConfig;

    #[derive(Default)]
    struct StubExecutor {
        sent: Mutex<Vec<String>>,
        banned: Mutex<Vec<(String, String, String)>>,
    }

    impl ActionExecutor for StubExecutor {
        async fn send_message(&self, text: String) -> bool {
            self.sent.lock().unwrap().push(text);
            true
        }

        async fn delete_message(&self, _message_id: String) -> bool {
            true
        }

        async fn ban_user(&self, login: String, expires_in: String, reason: String) -> bool {
            self.banned.lock().unwrap().push((login, expires_in, reason));
            true
        }

        async fn capture_screenshot(&self, _format: String) -> Option<Screenshot> {
            Some(Screenshot {
                image: vec![9; 8],
                width: 640,
                height: 360,
            })
        }

        async fn relationship(
            &self,
            viewer: String,
            _channel: String,
        ) -> Option<ViewerRelationship> {
            (viewer == "regular").then(|| ViewerRelationship {
                followed_at: Some(1_700_000_000_000),
                total_subscribed_months: 12,
                subscription_days_remaining: 20,
                subscription: Some(SubscriptionInfo {
                    is_gift: false,
                    purchased_with_prime: true,
                    tier: "1000".into(),
                }),
            })
        }

        async fn play_audio(&self, url: String) -> bool {
            url.ends_with(".mp3")
        }
    }

    fn routed_runner() -> (SupervisedTaskRunner, Arc<StubExecutor>) {
        let runner = SupervisedTaskRunner::new(
            RunnerConfig {
                execute_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            MessageLog::new(),
        );
        let executor = Arc::new(StubExecutor::default());
        tokio::spawn(ActionRouter::new(executor.clone(), runner.clone()).run());
        (runner, executor)
    }

    #[tokio::test]
    async fn fire_and_forget_actions_reach_the_executor() {
        let (runner, executor) = routed_runner();
        runner
            .upload(FunctionSpec::sync(
                "moderate",
                vec![],
                "chat.sendMessage('welcome'); chat.banUser('spammer', '600', 'links'); return true;",
            ))
            .await
            .unwrap();
        runner.execute("moderate", vec![]).await.unwrap();

        // The router runs concurrently; give it a moment to drain
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(executor.sent.lock().unwrap().as_slice(), ["welcome"]);
        assert_eq!(
            executor.banned.lock().unwrap().as_slice(),
            [("spammer".to_string(), "600".to_string(), "links".to_string())]
        );
    }

    #[tokio::test]
    async fn screenshot_round_trip_unblocks_the_widget() {
        let (runner, _executor) = routed_runner();
        runner
            .upload(FunctionSpec::sync(
                "snap",
                vec![],
                "var s = host.captureScreenshot(); return [s.width, s.height];",
            ))
            .await
            .unwrap();
        let value = runner.execute("snap", vec![]).await.unwrap();
        assert_eq!(value, json!([640, 360]));
    }

    #[tokio::test]
    async fn relationship_round_trip_returns_camel_case_fields() {
        let (runner, _executor) = routed_runner();
        runner
            .upload(FunctionSpec::sync(
                "months",
                vec!["viewer".into()],
                "var r = host.relationship(viewer, 'chan'); \
                 return r === null ? -1 : r.totalSubscribedMonths;",
            ))
            .await
            .unwrap();
        let known = runner.execute("months", vec![json!("regular")]).await.unwrap();
        assert_eq!(known, json!(12));
        let unknown = runner.execute("months", vec![json!("lurker")]).await.unwrap();
        assert_eq!(unknown, json!(-1));
    }

    #[tokio::test]
    async fn audio_round_trip_reports_success() {
        let (runner, _executor) = routed_runner();
        runner
            .upload(FunctionSpec::sync(
                "ding",
                vec![],
                "return [host.playAudio('ding.mp3'), host.playAudio('ding.wav')];",
            ))
            .await
            .unwrap();
        let value = runner.execute("ding", vec![]).await.unwrap();
        assert_eq!(value, json!([true, false]));
    }
}
