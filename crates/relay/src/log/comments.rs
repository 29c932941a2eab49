// Comment thread rules: content limits, reply inheritance, cycle checks.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use formcollab_common::path::TargetPath;
use formcollab_common::types::Comment;
use thiserror::Error;
use uuid::Uuid;

use super::{LogError, LogStore};

pub const MAX_COMMENT_CHARS: usize = 10_000;

#[derive(Debug, Error)]
pub enum CommentError {
    #[error("comment content must not be empty")]
    EmptyContent,

    #[error("comment content exceeds {MAX_COMMENT_CHARS} characters ({0})")]
    ContentTooLong(usize),

    #[error("comment {0} not found")]
    NotFound(Uuid),

    #[error("parent comment {0} belongs to another room")]
    ForeignParent(Uuid),

    #[error("comment thread containing {0} has a cyclic parent chain")]
    Cycle(Uuid),

    #[error("comment {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("participant may not comment in this room")]
    PermissionDenied,

    #[error(transparent)]
    Log(#[from] LogError),
}

/// Input for a new comment, before thread placement.
#[derive(Debug, Clone)]
pub struct CommentDraft {
    pub room_id: Uuid,
    pub author_id: Uuid,
    pub target_path: TargetPath,
    pub content: String,
    pub parent_comment_id: Option<Uuid>,
    pub mentions: Vec<Uuid>,
}

pub fn validate_content(content: &str) -> Result<(), CommentError> {
    if content.trim().is_empty() {
        return Err(CommentError::EmptyContent);
    }
    let chars = content.chars().count();
    if chars > MAX_COMMENT_CHARS {
        return Err(CommentError::ContentTooLong(chars));
    }
    Ok(())
}

/// Places a draft in its thread and persists it. Replies take the parent's
/// target path and thread. Callers serialize per room so positions stay dense.
pub async fn create_comment(
    log: &LogStore,
    draft: CommentDraft,
    now: DateTime<Utc>,
) -> Result<Comment, CommentError> {
    validate_content(&draft.content)?;

    let comment_id = Uuid::new_v4();
    let (target_path, thread_id) = match draft.parent_comment_id {
        Some(parent_id) => {
            let parent = log.comment(parent_id).await?.ok_or(CommentError::NotFound(parent_id))?;
            if parent.room_id != draft.room_id {
                return Err(CommentError::ForeignParent(parent_id));
            }
            ensure_acyclic(log, &parent).await?;
            (parent.target_path, parent.thread_id)
        }
        None => (draft.target_path, comment_id),
    };

    let position = log.next_comment_position(thread_id).await?;

    let mut mentions = Vec::with_capacity(draft.mentions.len());
    for mention in draft.mentions {
        if !mentions.contains(&mention) {
            mentions.push(mention);
        }
    }

    let comment = Comment {
        comment_id,
        room_id: draft.room_id,
        target_path,
        author_id: draft.author_id,
        content: draft.content,
        parent_comment_id: draft.parent_comment_id,
        thread_id,
        position,
        mentions,
        resolved: false,
        resolved_by: None,
        resolved_at: None,
        created_at: now,
    };
    log.insert_comment(&comment).await?;
    Ok(comment)
}

/// Marks a comment resolved. Resolving twice is an error.
pub async fn resolve_comment(
    log: &LogStore,
    room_id: Uuid,
    comment_id: Uuid,
    resolver_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Comment, CommentError> {
    let mut comment = log
        .comment(comment_id)
        .await?
        .filter(|comment| comment.room_id == room_id)
        .ok_or(CommentError::NotFound(comment_id))?;
    if comment.resolved {
        return Err(CommentError::AlreadyResolved(comment_id));
    }

    comment.resolved = true;
    comment.resolved_by = Some(resolver_id);
    comment.resolved_at = Some(now);
    log.update_comment(&comment).await?;
    Ok(comment)
}

/// Walks the parent chain from `start` to its root.
async fn ensure_acyclic(log: &LogStore, start: &Comment) -> Result<(), CommentError> {
    let mut seen = HashSet::from([start.comment_id]);
    let mut next = start.parent_comment_id;
    while let Some(parent_id) = next {
        if !seen.insert(parent_id) {
            return Err(CommentError::Cycle(start.comment_id));
        }
        next = match log.comment(parent_id).await? {
            Some(parent) => parent.parent_comment_id,
            None => None,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use formcollab_common::path::TargetPath;
    use formcollab_common::types::ConflictStrategy;
    use uuid::Uuid;

    use super::*;

    fn draft(room_id: Uuid, parent: Option<Uuid>, path: &str, content: &str) -> CommentDraft {
        CommentDraft {
            room_id,
            author_id: Uuid::new_v4(),
            target_path: TargetPath::parse(path).expect("path should parse"),
            content: content.to_string(),
            parent_comment_id: parent,
            mentions: Vec::new(),
        }
    }

    async fn log_with_room(room_id: Uuid) -> LogStore {
        let log = LogStore::in_memory();
        log.ensure_room(room_id, ConflictStrategy::LastWriteWins, Utc::now())
            .await
            .expect("room should be created");
        log
    }

    #[test]
    fn content_limits() {
        assert!(matches!(validate_content("   "), Err(CommentError::EmptyContent)));
        assert!(validate_content(&"x".repeat(MAX_COMMENT_CHARS)).is_ok());
        assert!(matches!(
            validate_content(&"x".repeat(MAX_COMMENT_CHARS + 1)),
            Err(CommentError::ContentTooLong(len)) if len == MAX_COMMENT_CHARS + 1
        ));
    }

    #[tokio::test]
    async fn replies_inherit_path_and_thread_with_increasing_positions() {
        let room_id = Uuid::new_v4();
        let log = log_with_room(room_id).await;

        let root = create_comment(&log, draft(room_id, None, "f1.label", "root"), Utc::now())
            .await
            .expect("root comment should be created");
        assert_eq!(root.thread_id, root.comment_id);
        assert_eq!(root.position, 1);

        let reply = create_comment(
            &log,
            draft(room_id, Some(root.comment_id), "somewhere.else", "reply"),
            Utc::now(),
        )
        .await
        .expect("reply should be created");
        assert_eq!(reply.thread_id, root.thread_id);
        assert_eq!(reply.target_path, root.target_path);
        assert_eq!(reply.position, 2);

        let nested = create_comment(&log, draft(room_id, Some(reply.comment_id), "", "nested"), Utc::now())
            .await
            .expect("nested reply should be created");
        assert_eq!(nested.position, 3);
        assert_eq!(log.comments_for_room(room_id).await.expect("list").len(), 3);
    }

    #[tokio::test]
    async fn parent_must_exist_in_same_room() {
        let room_id = Uuid::new_v4();
        let other_room = Uuid::new_v4();
        let log = log_with_room(room_id).await;
        log.ensure_room(other_room, ConflictStrategy::LastWriteWins, Utc::now())
            .await
            .expect("room should be created");

        let missing = Uuid::new_v4();
        let error = create_comment(&log, draft(room_id, Some(missing), "f1", "hi"), Utc::now())
            .await
            .expect_err("unknown parent should fail");
        assert!(matches!(error, CommentError::NotFound(id) if id == missing));

        let foreign = create_comment(&log, draft(other_room, None, "f1", "there"), Utc::now())
            .await
            .expect("comment should be created");
        let error =
            create_comment(&log, draft(room_id, Some(foreign.comment_id), "f1", "hi"), Utc::now())
                .await
                .expect_err("foreign parent should fail");
        assert!(matches!(error, CommentError::ForeignParent(_)));
    }

    #[tokio::test]
    async fn cyclic_parent_chain_is_detected() {
        let room_id = Uuid::new_v4();
        let log = log_with_room(room_id).await;
        let first = create_comment(&log, draft(room_id, None, "f1", "a"), Utc::now())
            .await
            .expect("first comment");
        let second =
            create_comment(&log, draft(room_id, Some(first.comment_id), "f1", "b"), Utc::now())
                .await
                .expect("second comment");

        // Corrupt the stored chain so the root points back at its reply.
        let mut corrupted = first.clone();
        corrupted.parent_comment_id = Some(second.comment_id);
        log.update_comment(&corrupted).await.expect("update");

        let error =
            create_comment(&log, draft(room_id, Some(second.comment_id), "f1", "c"), Utc::now())
                .await
                .expect_err("cycle should be rejected");
        assert!(matches!(error, CommentError::Cycle(_)));
    }

    #[tokio::test]
    async fn resolving_twice_is_an_error() {
        let room_id = Uuid::new_v4();
        let log = log_with_room(room_id).await;
        let comment = create_comment(&log, draft(room_id, None, "f1", "fix me"), Utc::now())
            .await
            .expect("comment should be created");
        let resolver = Uuid::new_v4();

        let resolved = resolve_comment(&log, room_id, comment.comment_id, resolver, Utc::now())
            .await
            .expect("first resolve should succeed");
        assert!(resolved.resolved);
        assert_eq!(resolved.resolved_by, Some(resolver));
        assert!(resolved.resolved_at.is_some());

        let error = resolve_comment(&log, room_id, comment.comment_id, resolver, Utc::now())
            .await
            .expect_err("second resolve should fail");
        assert!(matches!(error, CommentError::AlreadyResolved(_)));

        let error = resolve_comment(&log, Uuid::new_v4(), comment.comment_id, resolver, Utc::now())
            .await
            .expect_err("other room should not see the comment");
        assert!(matches!(error, CommentError::NotFound(_)));
    }
}
