use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Resource, ResourceExt};
use tracing::*;

/// Publish a Normal event about `obj`. Publishing is best effort: failures
/// are logged and otherwise ignored, and nothing happens without a recorder.
pub async fn emit_info<R: Resource<DynamicType = ()> + ResourceExt>(
    recorder: Option<&Recorder>,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<Option<String>>,
) {
    let Some(recorder) = recorder else {
        return;
    };
    let published = recorder
        .publish(
            &Event {
                type_: EventType::Normal,
                reason: reason.into(),
                note: note.into(),
                action: action.into(),
                secondary: None,
            },
            &obj.object_ref(&()),
        )
        .await;
    if let Err(e) = published {
        debug!("failed to publish {} event for {}: {}", reason, obj.name_any(), e);
    }
}
