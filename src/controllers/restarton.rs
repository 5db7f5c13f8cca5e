//! Trigger computation.
//!
//! Resolves the buttons and file watches a target depends on and turns them
//! into "last start" / "last restart" timestamps and changed-file lists.
//!
//! Resolution is strict: any failed lookup fails the whole call. Consumption
//! is lenient: a name missing from an already-resolved map is skipped, so a
//! partial map can only undercount triggers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::adapters::ObjectClient;
use crate::domain::{FileWatch, ObjectKind, RestartOnSpec, StartOnSpec, UiButton};
use crate::error::Result;

/// Buttons referenced by `start_on` and `restart_on`, keyed by name
pub async fn resolve_buttons(
    client: &dyn ObjectClient,
    restart_on: Option<&RestartOnSpec>,
    start_on: Option<&StartOnSpec>,
) -> Result<HashMap<String, UiButton>> {
    let names = start_on
        .map(|s| s.ui_buttons.as_slice())
        .unwrap_or_default()
        .iter()
        .chain(
            restart_on
                .map(|r| r.ui_buttons.as_slice())
                .unwrap_or_default(),
        );

    let mut result = HashMap::new();
    for name in names {
        if result.contains_key(name) {
            continue;
        }
        let button = UiButton::try_from(client.get(ObjectKind::UiButton, name).await?)?;
        result.insert(name.clone(), button);
    }
    Ok(result)
}

/// File watches referenced by `restart_on`; empty when there is no spec
pub async fn resolve_file_watches(
    client: &dyn ObjectClient,
    restart_on: Option<&RestartOnSpec>,
) -> Result<HashMap<String, FileWatch>> {
    let Some(restart_on) = restart_on else {
        return Ok(HashMap::new());
    };

    let mut result = HashMap::with_capacity(restart_on.file_watches.len());
    for name in &restart_on.file_watches {
        let fw = FileWatch::try_from(client.get(ObjectKind::FileWatch, name).await?)?;
        result.insert(name.clone(), fw);
    }
    Ok(result)
}

/// Most recent click at or after `start_after`, and the button it came from.
///
/// Ties keep the first button in spec order.
pub fn last_start_event<'a>(
    start_on: Option<&StartOnSpec>,
    buttons: &'a HashMap<String, UiButton>,
) -> (Option<DateTime<Utc>>, Option<&'a UiButton>) {
    let Some(start_on) = start_on else {
        return (None, None);
    };

    let mut latest: Option<DateTime<Utc>> = None;
    let mut latest_button = None;
    for name in &start_on.ui_buttons {
        let Some(button) = buttons.get(name) else {
            continue;
        };
        let clicked = button.last_clicked_at();
        if clicked >= start_on.start_after && clicked > latest {
            latest = clicked;
            latest_button = Some(button);
        }
    }
    (latest, latest_button)
}

/// Most recent restart request across file watches and buttons.
///
/// File watches set the baseline and never attribute a button. A button is
/// attributed only when its click is strictly later than everything seen
/// before it, file watches included.
pub fn last_restart_event<'a>(
    restart_on: Option<&RestartOnSpec>,
    file_watches: &HashMap<String, FileWatch>,
    buttons: &'a HashMap<String, UiButton>,
) -> (Option<DateTime<Utc>>, Option<&'a UiButton>) {
    let Some(restart_on) = restart_on else {
        return (None, None);
    };

    let mut cur: Option<DateTime<Utc>> = None;
    for name in &restart_on.file_watches {
        let Some(fw) = file_watches.get(name) else {
            continue;
        };
        cur = cur.max(fw.last_event_time());
    }

    let mut latest_button = None;
    for name in &restart_on.ui_buttons {
        let Some(button) = buttons.get(name) else {
            continue;
        };
        let clicked = button.last_clicked_at();
        if clicked > cur {
            cur = clicked;
            latest_button = Some(button);
        }
    }
    (cur, latest_button)
}

/// Files seen by the referenced watches after `last_build`, sorted and deduplicated
pub fn files_changed(
    restart_on: &RestartOnSpec,
    file_watches: &HashMap<String, FileWatch>,
    last_build: Option<DateTime<Utc>>,
) -> Vec<String> {
    let mut files = Vec::new();
    for name in &restart_on.file_watches {
        let Some(fw) = file_watches.get(name) else {
            continue;
        };
        // Full scan: event order is not relied upon.
        for event in fw.status.file_events.iter().rev() {
            if Some(event.time) > last_build {
                files.extend(event.seen_files.iter().cloned());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}
