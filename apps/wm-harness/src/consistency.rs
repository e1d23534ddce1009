//! Cross-checks the subject's group and screen bookkeeping.

use crate::error::HarnessResult;
use crate::ipc::ControlClient;
use harness_proto::{GroupSnapshot, ScreenSnapshot};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyViolation {
    #[error("screen {screen} referenced from more than one group ('{first}' and '{second}')")]
    ScreenClaimedTwice {
        screen: usize,
        first: String,
        second: String,
    },
    #[error("group '{group}' claims screen {screen} but only {screens} screens exist")]
    UnknownScreen {
        group: String,
        screen: usize,
        screens: usize,
    },
    #[error("screen {screen} reports group {reported:?} but group '{claimed_by}' claims it")]
    GroupMismatch {
        screen: usize,
        claimed_by: String,
        reported: Option<String>,
    },
    #[error("screens {unattached:?} have no attached group ({screens} screens in total)")]
    UnattachedScreens {
        unattached: Vec<usize>,
        screens: usize,
    },
    #[error("screen listed at position {position} reports index {index}")]
    MisnumberedScreen { position: usize, index: usize },
}

/// Evaluates the group/screen invariants over one pair of snapshots.
pub fn validate(groups: &GroupSnapshot, screens: &ScreenSnapshot) -> Result<(), ConsistencyViolation> {
    // Claims are resolved by position below, so the two must agree.
    if let Some((position, info)) = screens
        .iter()
        .enumerate()
        .find(|(position, info)| info.index != *position)
    {
        return Err(ConsistencyViolation::MisnumberedScreen {
            position,
            index: info.index,
        });
    }

    let mut seen: BTreeMap<usize, &str> = BTreeMap::new();

    for group in groups.values() {
        let Some(screen) = group.screen else {
            continue;
        };
        let name = group.name.as_str();
        if let Some(first) = seen.insert(screen, name) {
            return Err(ConsistencyViolation::ScreenClaimedTwice {
                screen,
                first: first.to_string(),
                second: name.to_string(),
            });
        }
        let Some(info) = screens.get(screen) else {
            return Err(ConsistencyViolation::UnknownScreen {
                group: name.to_string(),
                screen,
                screens: screens.len(),
            });
        };
        if info.group.as_deref() != Some(name) {
            return Err(ConsistencyViolation::GroupMismatch {
                screen,
                claimed_by: name.to_string(),
                reported: info.group.clone(),
            });
        }
    }

    let unattached: Vec<usize> = (0..screens.len())
        .filter(|screen| !seen.contains_key(screen))
        .collect();
    if !unattached.is_empty() {
        return Err(ConsistencyViolation::UnattachedScreens {
            unattached,
            screens: screens.len(),
        });
    }
    Ok(())
}

/// Fetches fresh snapshots (two separate calls, no retry) and validates them.
pub fn check(client: &ControlClient) -> HarnessResult<()> {
    let groups = client.groups()?;
    let screens = client.screens()?;
    validate(&groups, &screens)?;
    debug!(
        target: "wm_harness::consistency",
        groups = groups.len(),
        screens = screens.len(),
        "group/screen state consistent"
    );
    Ok(())
}
