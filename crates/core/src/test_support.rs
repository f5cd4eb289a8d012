// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers for use across crates.
//!
//! Gated behind `#[cfg(any(test, feature = "test-support"))]`.

use crate::instance::{InstanceAnnouncement, InstanceId};

/// Announcement for a loopback instance with a single workspace folder.
pub fn announcement(instance_id: &str, port: u16, folder: &str) -> InstanceAnnouncement {
    InstanceAnnouncement {
        instance_id: InstanceId::new(instance_id),
        pid: 1000,
        host: "127.0.0.1".to_string(),
        port,
        workspace_folders: vec![folder.to_string()],
        workspace_file: None,
    }
}

/// Announcement with several folders and an optional workspace file.
pub fn announcement_multi(
    instance_id: &str,
    port: u16,
    folders: &[&str],
    workspace_file: Option<&str>,
) -> InstanceAnnouncement {
    InstanceAnnouncement {
        instance_id: InstanceId::new(instance_id),
        pid: 1000,
        host: "127.0.0.1".to_string(),
        port,
        workspace_folders: folders.iter().map(|f| f.to_string()).collect(),
        workspace_file: workspace_file.map(|f| f.to_string()),
    }
}
