// Read-side HTTP API over rooms, plus explicit room termination.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use formcollab_common::types::{Comment, ConflictStrategy, Operation, ParticipantSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};
use crate::rooms::RoomRegistry;

pub fn router(registry: RoomRegistry) -> Router {
    Router::new()
        .route("/v1/rooms/{room_id}/operations", get(list_operations))
        .route("/v1/rooms/{room_id}/document", get(get_document))
        .route("/v1/rooms/{room_id}/participants", get(list_participants))
        .route("/v1/rooms/{room_id}/comments", get(list_comments))
        .route("/v1/rooms/{room_id}/close", post(close_room))
        .with_state(registry)
}

#[derive(Deserialize)]
struct OperationsQuery {
    since: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct OperationsEnvelope {
    room_id: Uuid,
    since: i64,
    operations: Vec<Operation>,
}

#[derive(Serialize, Deserialize)]
struct DocumentEnvelope {
    room_id: Uuid,
    strategy: ConflictStrategy,
    head_sequence: i64,
    document: Value,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ParticipantsEnvelope {
    room_id: Uuid,
    participants: Vec<ParticipantSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct CommentsEnvelope {
    room_id: Uuid,
    comments: Vec<Comment>,
}

#[derive(Serialize, Deserialize)]
struct CloseEnvelope {
    room_id: Uuid,
    closed: bool,
}

async fn list_operations(
    State(registry): State<RoomRegistry>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<OperationsQuery>,
) -> Result<Json<OperationsEnvelope>, RelayError> {
    let since = query.since.unwrap_or(0);
    if since < 0 {
        return Err(RelayError::new(ErrorCode::ValidationFailed, "since must be non-negative"));
    }
    let operations = registry.read_since(room_id, since).await?;
    Ok(Json(OperationsEnvelope { room_id, since, operations }))
}

async fn get_document(
    State(registry): State<RoomRegistry>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<DocumentEnvelope>, RelayError> {
    let record = registry
        .room_record(room_id)
        .await?
        .ok_or_else(|| RelayError::room_not_found(room_id))?;
    let (head_sequence, document) = registry.document(room_id).await?;
    Ok(Json(DocumentEnvelope {
        room_id,
        strategy: record.strategy,
        head_sequence,
        document,
        closed_at: record.closed_at,
    }))
}

async fn list_participants(
    State(registry): State<RoomRegistry>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<ParticipantsEnvelope>, RelayError> {
    let participants = registry.participants(room_id).await?;
    Ok(Json(ParticipantsEnvelope { room_id, participants }))
}

async fn list_comments(
    State(registry): State<RoomRegistry>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<CommentsEnvelope>, RelayError> {
    let comments = registry.comments(room_id).await?;
    Ok(Json(CommentsEnvelope { room_id, comments }))
}

async fn close_room(
    State(registry): State<RoomRegistry>,
    Path(room_id): Path<Uuid>,
) -> Result<Json<CloseEnvelope>, RelayError> {
    if registry.room_record(room_id).await?.is_none() {
        return Err(RelayError::room_not_found(room_id));
    }
    let closed = registry.close_room(room_id).await?;
    Ok(Json(CloseEnvelope { room_id, closed }))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use formcollab_common::clock::VectorClock;
    use formcollab_common::path::TargetPath;
    use formcollab_common::types::{Identity, OperationKind, ProposedOperation};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RoomSettings;
    use crate::rooms::{JoinRequest, Origin, RoomDeps};

    async fn response_json(response: axum::response::Response) -> Value {
        let bytes =
            to_bytes(response.into_body(), usize::MAX).await.expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be json")
    }

    fn get(uri: String) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    async fn room_with_one_field() -> (RoomRegistry, Uuid) {
        let registry = RoomRegistry::new(RoomDeps::in_memory(RoomSettings::default()));
        let room_id = Uuid::new_v4();
        let (room, joined) = registry
            .join(
                room_id,
                JoinRequest {
                    identity: Identity::User { user_id: Uuid::from_u128(7) },
                    display_name: "Ada".to_string(),
                    conflict_strategy: Some(ConflictStrategy::Merge),
                    last_sequence: None,
                },
                None,
            )
            .await
            .expect("join should succeed");
        let outcome = room
            .submit(
                Origin { participant_id: joined.participant.participant_id, connection_id: None },
                ProposedOperation {
                    idempotency_id: Uuid::new_v4(),
                    kind: OperationKind::InsertField,
                    target_path: TargetPath::parse("f1").expect("path should parse"),
                    new_value: Some(json!({ "label": "Email" })),
                    client_vector_clock: VectorClock::new(),
                },
            )
            .await
            .expect("submit should succeed");
        assert!(outcome.is_accepted());
        (registry, room_id)
    }

    #[tokio::test]
    async fn document_and_operations_reflect_the_log() {
        let (registry, room_id) = room_with_one_field().await;
        let app = router(registry);

        let response = app
            .clone()
            .oneshot(get(format!("/v1/rooms/{room_id}/document")))
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["head_sequence"], 1);
        assert_eq!(body["strategy"], "merge");
        assert_eq!(body["document"]["f1"]["label"], "Email");

        let response = app
            .clone()
            .oneshot(get(format!("/v1/rooms/{room_id}/operations?since=0")))
            .await
            .expect("request should return response");
        let body = response_json(response).await;
        assert_eq!(body["operations"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["operations"][0]["sequence_number"], 1);

        let response = app
            .oneshot(get(format!("/v1/rooms/{room_id}/operations?since=-1")))
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_rooms_return_not_found_envelope() {
        let app = router(RoomRegistry::new(RoomDeps::in_memory(RoomSettings::default())));
        let response = app
            .oneshot(get(format!("/v1/rooms/{}/comments", Uuid::new_v4())))
            .await
            .expect("request should return response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response_json(response).await;
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn close_ends_the_room_and_keeps_it_readable() {
        let (registry, room_id) = room_with_one_field().await;
        let app = router(registry.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/v1/rooms/{room_id}/close"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["closed"], true);
        assert!(registry.room(room_id).await.is_none());

        let response = app
            .clone()
            .oneshot(get(format!("/v1/rooms/{room_id}/participants")))
            .await
            .expect("request should return response");
        assert_eq!(response_json(response).await["participants"], json!([]));

        let response = app
            .oneshot(get(format!("/v1/rooms/{room_id}/document")))
            .await
            .expect("request should return response");
        let body = response_json(response).await;
        assert_eq!(body["head_sequence"], 1);
        assert!(body["closed_at"].is_string());
    }
}
