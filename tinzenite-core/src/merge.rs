//! Conflict resolution by sibling materialization.
//!
//! When neither version vector dominates, the local bytes survive as
//! `<name>.LOCAL` and the remote bytes as `<name>.REMOTE`, both as brand-new
//! objects, and the contested name is removed. Directories never reach this
//! point: they only create and remove.

use std::fs;

use crate::error::Result;
use crate::ids::new_identification;
use crate::messages::UpdateMessage;
use crate::model::{ApplyResult, Model};
use crate::object::Operation;
use crate::paths::{Layout, terminal_name};

pub const LOCAL_SUFFIX: &str = ".LOCAL";
pub const REMOTE_SUFFIX: &str = ".REMOTE";

/// Resolve a conflicting update whose content has already been fetched to
/// `temp/<identification>`.
pub async fn resolve(
    model: &mut Model,
    layout: &Layout,
    msg: &UpdateMessage,
    sender: &str,
) -> Result<()> {
    let object = &msg.object;
    if object.directory {
        return Ok(());
    }

    // Compare against the latest on-disk state, not a stale scan.
    model.partial_update(&object.path).await?;
    let local = model.get_info(&object.path)?;
    let remote_hash = object.content.clone().unwrap_or_default();
    if local.content.clone().unwrap_or_default() == remote_hash {
        // Same bytes after all; only the version vector moves.
        return model.adopt_version(&local.identification, &object.version);
    }

    tracing::info!(path = %object.path, "materializing conflict siblings");

    let local_sibling = format!("{}{}", object.path, LOCAL_SUFFIX);
    let remote_sibling = format!("{}{}", object.path, REMOTE_SUFFIX);

    fs::rename(
        layout.absolute(&object.path),
        layout.absolute(&local_sibling),
    )?;
    model.create_local(&local_sibling).await?;
    model.remove_local(&object.path).await?;

    // The fetched temp file becomes the remote sibling under a fresh
    // identification.
    let fresh = new_identification();
    fs::rename(
        layout.temp_file(&object.identification),
        layout.temp_file(&fresh),
    )?;
    let mut clone = object.without_children();
    clone.identification = fresh;
    clone.name = terminal_name(&remote_sibling).to_string();
    clone.path = remote_sibling.clone();
    let clone_msg = UpdateMessage {
        operation: Operation::Create,
        object: clone,
    };
    let applied = model.apply_update(&clone_msg, sender)?;
    if applied != ApplyResult::Applied {
        tracing::warn!(path = %remote_sibling, ?applied, "remote sibling was not applied");
        return Ok(());
    }
    // Announce the sibling so every trusted peer converges on it.
    let announced = model.get_info(&remote_sibling)?;
    model.announce(Operation::Create, announced).await;
    Ok(())
}
