//! Microphone permission boundary

use async_trait::async_trait;

/// Current microphone grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Never asked
    Undetermined,
    /// Access allowed
    Granted,
    /// Access refused
    Denied,
}

/// Platform permissions API for microphone access
#[async_trait]
pub trait MicrophonePermission: Send + Sync {
    /// Current status without prompting
    fn status(&self) -> PermissionStatus;

    /// Prompt the user if needed and return the resulting status
    async fn request(&self) -> PermissionStatus;
}

/// Desktop hosts grant access at the OS level; opening the device is the check
#[derive(Debug, Default, Clone, Copy)]
pub struct OsManagedPermission;

#[async_trait]
impl MicrophonePermission for OsManagedPermission {
    fn status(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }
}
