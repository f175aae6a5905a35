use std::{fmt::Debug, time::Duration};

use json_patch::{Patch as JsonPatch, PatchOperation, TestOperation, jsonptr::PointerBuf};
use kube::{
    Resource, ResourceExt,
    api::{Api, Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::*;

use crate::{Error, Result, helper::jittered};

const MAX_CONFLICT_RETRIES: usize = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(200);

fn split_status(mut value: Value) -> (Value, Value) {
    let status = value
        .as_object_mut()
        .and_then(|o| o.remove("status"))
        .unwrap_or(Value::Null);
    (value, status)
}

/// JSON patch turning `before` into `after`, ignoring status.
///
/// A test on `resourceVersion` guards the patch so a concurrent writer
/// makes it fail rather than be overwritten.
pub fn object_patch(before: &Value, after: &Value) -> JsonPatch {
    let (before, _) = split_status(before.clone());
    let (after, _) = split_status(after.clone());
    let ops = json_patch::diff(&before, &after).0;
    if ops.is_empty() {
        return JsonPatch(ops);
    }
    let guard = before
        .pointer("/metadata/resourceVersion")
        .cloned()
        .map(|version| {
            PatchOperation::Test(TestOperation {
                path: PointerBuf::from_tokens(vec!["metadata", "resourceVersion"]),
                value: version,
            })
        });
    JsonPatch(guard.into_iter().chain(ops).collect())
}

/// Merge patch applying the status changes between `before` and `after` onto
/// `current`, `None` when nothing is left to change.
///
/// Only differing fields are sent; removed fields become `null`. Conditions
/// are matched by `type`, so conditions another writer changed in `current`
/// are left alone.
pub fn status_patch(current: &Value, before: &Value, after: &Value) -> Option<Value> {
    let (_, current) = split_status(current.clone());
    let (_, before) = split_status(before.clone());
    let (_, after) = split_status(after.clone());
    let desired = rebase_status(&current, &before, &after)?;
    merge_diff(&current, &desired).map(|status| json!({ "status": status }))
}

fn rebase_status(current: &Value, before: &Value, after: &Value) -> Option<Value> {
    let delta = merge_diff(before, after)?;
    let mut out = current.clone();
    json_patch::merge(&mut out, &delta);

    let conditions = |v: &Value| {
        v.get("conditions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let (old, new) = (conditions(before), conditions(after));
    if old != new
        && let Some(obj) = out.as_object_mut()
    {
        let key = |c: &Value| c.get("type").cloned();
        let mut merged = conditions(current);
        merged.retain(|c| {
            new.iter().any(|n| key(n) == key(c)) || !old.iter().any(|o| key(o) == key(c))
        });
        for cond in new.iter().filter(|c| !old.contains(c)) {
            match merged.iter_mut().find(|m| key(m) == key(cond)) {
                Some(m) => *m = cond.clone(),
                None => merged.push(cond.clone()),
            }
        }
        obj.insert("conditions".into(), Value::Array(merged));
    }
    Some(out)
}

fn merge_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut out = serde_json::Map::new();
            for (key, old) in b {
                match a.get(key) {
                    None => {
                        out.insert(key.clone(), Value::Null);
                    }
                    Some(new) => {
                        if let Some(d) = merge_diff(old, new) {
                            out.insert(key.clone(), d);
                        }
                    }
                }
            }
            for (key, new) in a.iter().filter(|(k, _)| !b.contains_key(*k)) {
                out.insert(key.clone(), new.clone());
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        _ => (before != after).then(|| after.clone()),
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    // 422 is what a failed test operation comes back as
    matches!(e, kube::Error::Api(resp) if resp.code == 409 || resp.code == 422)
}

/// Persists every change between `before` and `after`, spec/metadata first, then status.
///
/// On a conflict the object is re-read and the same changes are rebased onto
/// the fresh copy. The status merge patch is pinned to the latest known
/// `resourceVersion`.
pub async fn patch_object<K>(api: &Api<K>, before: &K, after: &K) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = after.name_any();
    let before_value = serde_json::to_value(before).map_err(Error::SerializationError)?;
    let after_value = serde_json::to_value(after).map_err(Error::SerializationError)?;

    let changes: Vec<PatchOperation> = object_patch(&before_value, &after_value)
        .0
        .into_iter()
        .filter(|op| !matches!(op, PatchOperation::Test(_)))
        .collect();

    let mut current = before_value.clone();
    let mut resource_version = before.resource_version();
    let mut attempt = 0;
    while !changes.is_empty() {
        let mut desired = current.clone();
        json_patch::patch(&mut desired, &changes)
            .map_err(|e| Error::OtherError(format!("rebasing changes onto {name}: {e}")))?;
        let patch = object_patch(&current, &desired);
        if patch.0.is_empty() {
            break;
        }
        match api
            .patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
        {
            Ok(patched) => {
                resource_version = patched.resource_version();
                break;
            }
            Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!("conflict patching {name}, retrying ({attempt}/{MAX_CONFLICT_RETRIES})");
                tokio::time::sleep(jittered(CONFLICT_BACKOFF)).await;
                let fresh = api.get(&name).await.map_err(Error::KubeError)?;
                resource_version = fresh.resource_version();
                current = serde_json::to_value(&fresh).map_err(Error::SerializationError)?;
            }
            // deleted while we were working on it
            Err(kube::Error::Api(resp)) if resp.code == 404 => return Ok(()),
            Err(e) => return Err(Error::KubeError(e)),
        }
    }

    // status is untouched by the object patch, so `current` is still a valid base
    let mut attempt = 0;
    while let Some(status) = status_patch(&current, &before_value, &after_value) {
        let body = guarded(status, resource_version.as_deref());
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
        {
            Ok(_) => break,
            Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                attempt += 1;
                debug!("conflict patching status of {name}, retrying ({attempt}/{MAX_CONFLICT_RETRIES})");
                tokio::time::sleep(jittered(CONFLICT_BACKOFF)).await;
                let fresh = api.get(&name).await.map_err(Error::KubeError)?;
                resource_version = fresh.resource_version();
                current = serde_json::to_value(&fresh).map_err(Error::SerializationError)?;
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => break,
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
    Ok(())
}

/// Pins a merge patch to `resource_version` so a stale write is rejected with 409.
fn guarded(mut patch: Value, resource_version: Option<&str>) -> Value {
    if let (Some(obj), Some(rv)) = (patch.as_object_mut(), resource_version) {
        obj.insert("metadata".into(), json!({ "resourceVersion": rv }));
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_objects_produce_no_patch() {
        let obj = json!({"metadata": {"name": "c1", "resourceVersion": "7"}, "spec": {"paused": false}});
        assert!(object_patch(&obj, &obj).0.is_empty());
        assert!(status_patch(&obj, &obj, &obj).is_none());
    }

    #[test]
    fn patch_is_guarded_by_resource_version() {
        let before = json!({"metadata": {"name": "c1", "resourceVersion": "7"}});
        let after = json!({"metadata": {"name": "c1", "resourceVersion": "7", "labels": {"a": "b"}}});
        let patch = object_patch(&before, &after);
        assert!(matches!(&patch.0[0], PatchOperation::Test(t) if t.value == json!("7")));
        assert_eq!(patch.0.len(), 2);
    }

    #[test]
    fn status_changes_are_split_out() {
        let before = json!({"metadata": {"name": "c1"}, "status": {"phase": "Provisioned"}});
        let after = json!({"metadata": {"name": "c1"}, "status": {"phase": "Deleting"}});
        assert!(object_patch(&before, &after).0.is_empty());
        assert_eq!(
            status_patch(&before, &before, &after),
            Some(json!({"status": {"phase": "Deleting"}}))
        );
    }

    #[test]
    fn status_patch_only_carries_changed_fields() {
        let before = json!({"status": {
            "phase": "Provisioned",
            "observedGeneration": 3,
            "infrastructureReady": true,
            "failureMessage": "old"
        }});
        let after = json!({"status": {
            "phase": "Provisioned",
            "observedGeneration": 4,
            "infrastructureReady": true
        }});
        assert_eq!(
            status_patch(&before, &before, &after),
            Some(json!({"status": {"observedGeneration": 4, "failureMessage": null}}))
        );
    }

    #[test]
    fn status_patch_recurses_into_nested_objects() {
        let before = json!({"status": {"endpoint": {"host": "10.0.0.1", "port": 6443}}});
        let after = json!({"status": {"endpoint": {"host": "10.0.0.2", "port": 6443}}});
        assert_eq!(
            status_patch(&before, &before, &after),
            Some(json!({"status": {"endpoint": {"host": "10.0.0.2"}}}))
        );
    }

    #[test]
    fn condition_change_leaves_foreign_fields_alone() {
        let before = json!({"status": {
            "phase": "Provisioned",
            "conditions": [{"type": "Ready", "status": "False"}]
        }});
        let after = json!({"status": {
            "phase": "Provisioned",
            "conditions": [
                {"type": "Ready", "status": "False"},
                {"type": "AviResourceCleanupSucceeded", "status": "True"}
            ]
        }});
        let patch = status_patch(&before, &before, &after).expect("patch");
        assert!(patch["status"].get("phase").is_none());

        // another writer flipped Ready meanwhile; the retry must keep it
        let fresh = json!({"status": {
            "phase": "Provisioned",
            "conditions": [{"type": "Ready", "status": "True"}]
        }});
        let patch = status_patch(&fresh, &before, &after).expect("patch");
        assert_eq!(
            patch,
            json!({"status": {"conditions": [
                {"type": "Ready", "status": "True"},
                {"type": "AviResourceCleanupSucceeded", "status": "True"}
            ]}})
        );
    }

    #[test]
    fn already_applied_status_needs_no_patch() {
        let before = json!({"status": {"conditions": []}});
        let after = json!({"status": {"conditions": [{"type": "AviUserCleanupSucceeded", "status": "True"}]}});
        assert!(status_patch(&after, &before, &after).is_none());
    }

    #[test]
    fn status_patch_is_pinned_to_resource_version() {
        let body = guarded(json!({"status": {"phase": "Deleting"}}), Some("42"));
        assert_eq!(
            body,
            json!({"metadata": {"resourceVersion": "42"}, "status": {"phase": "Deleting"}})
        );
        let unpinned = guarded(json!({"status": {}}), None);
        assert!(unpinned.get("metadata").is_none());
    }

    #[test]
    fn changes_rebase_onto_a_fresh_copy() {
        let before = json!({"metadata": {"name": "c1", "resourceVersion": "1", "labels": {}}});
        let after = json!({"metadata": {"name": "c1", "resourceVersion": "1", "labels": {"avi": "adc-a"}}});
        let changes: Vec<_> = object_patch(&before, &after)
            .0
            .into_iter()
            .filter(|op| !matches!(op, PatchOperation::Test(_)))
            .collect();

        let mut fresh = json!({"metadata": {"name": "c1", "resourceVersion": "2", "labels": {"other": "x"}}});
        json_patch::patch(&mut fresh, &changes).expect("rebase");
        assert_eq!(fresh["metadata"]["labels"], json!({"other": "x", "avi": "adc-a"}));
    }
}
