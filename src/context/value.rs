//! Minimal dotted-path value addressing over a JSON tree.
//!
//! The real value-expression language (`Lookup`/`Fill`/`Make`/`String`/
//! `Unify`) is an external collaborator. This module is the
//! small internal stand-in the context store is built on: path lookup,
//! path-scoped merge, and structural unification of two JSON values.
//! Grounded on the reference engine's `resolve_nested` dotted-path walker
//! (`nodes/builtin/conditional_node.rs`), generalized to also write.

use serde_json::Value;

/// Split `a.b.c` into path segments. An empty string means "the whole
/// document" (used by `SetVar` with no path to replace everything).
pub fn segments(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    }
}

/// Read the value at `path` out of `root`, or `None` if any segment is
/// absent.
pub fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for seg in path {
        current = current.get(seg)?;
    }
    Some(current)
}

/// Write `value` at `path` inside `root`, creating intermediate objects as
/// needed. Fails if an intermediate segment exists but is not an object.
pub fn set(root: &mut Value, path: &[&str], value: Value) -> anyhow::Result<()> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    if !root.is_object() {
        *root = Value::Object(serde_json::Map::new());
    }
    let mut current = root;
    for seg in &path[..path.len() - 1] {
        let obj = current
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("path segment '{seg}' is not addressable"))?;
        current = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
    }
    let last = path[path.len() - 1];
    current
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("path segment '{last}' is not addressable"))?
        .insert(last.to_string(), value);
    Ok(())
}

/// Delete the field at `path`, no-op if absent.
pub fn delete(root: &mut Value, path: &[&str]) {
    if path.is_empty() {
        return;
    }
    let mut current = root;
    for seg in &path[..path.len() - 1] {
        match current.get_mut(*seg) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(obj) = current.as_object_mut() {
        obj.remove(path[path.len() - 1]);
    }
}

/// Drop every top-level field of `root` whose label is in `names`,
/// preserving everything else. Used to wipe the outputs of a restarted
/// step and its dependents out of the `vars` tree so downstream steps
/// never read a stale value from a prior failed attempt.
pub fn clear_named_fields(root: &mut Value, names: &[String]) {
    if let Some(obj) = root.as_object_mut() {
        for name in names {
            obj.remove(name);
        }
    }
}

/// Structurally unify `patch` into `target`: objects merge key by key
/// (recursively), any other value type replaces outright. This is the
/// `PatchComponent` / `Unify` primitive.
pub fn unify(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                unify(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (t, p) => {
            *t = p.clone();
        }
    }
}

/// Compile a string expression against the value schema into a JSON value.
/// The full expression language lives outside this crate; this reproduces
/// only the part of its contract this crate depends on: an empty expression
/// compiles to an empty object, anything else must already be valid JSON.
pub fn make_parameter(expr: &str) -> anyhow::Result<Value> {
    if expr.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(expr).map_err(|e| anyhow::anyhow!("invalid parameter expression: {e}"))
}
