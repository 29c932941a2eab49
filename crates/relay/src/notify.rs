use std::sync::Arc;

use formcollab_common::types::Comment;
use tracing::info;
use uuid::Uuid;

/// Receives one call per participant mentioned in a new comment.
pub trait MentionNotifier: Send + Sync {
    fn notify_mention(&self, mentioned: Uuid, comment: &Comment);
}

/// Default notifier: a structured event per mention for downstream log shipping.
#[derive(Debug, Default)]
pub struct TracingMentionNotifier;

impl MentionNotifier for TracingMentionNotifier {
    fn notify_mention(&self, mentioned: Uuid, comment: &Comment) {
        info!(
            room_id = %comment.room_id,
            comment_id = %comment.comment_id,
            author_id = %comment.author_id,
            mentioned_participant_id = %mentioned,
            target_path = %comment.target_path,
            "participant mentioned in comment"
        );
    }
}

pub fn default_notifier() -> Arc<dyn MentionNotifier> {
    Arc::new(TracingMentionNotifier)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records mentions for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub mentions: Mutex<Vec<(Uuid, Uuid)>>,
    }

    impl MentionNotifier for RecordingNotifier {
        fn notify_mention(&self, mentioned: Uuid, comment: &Comment) {
            self.mentions
                .lock()
                .expect("recording notifier lock poisoned")
                .push((mentioned, comment.comment_id));
        }
    }
}
