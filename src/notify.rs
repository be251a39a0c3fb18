//! Desktop notifications for user-actionable notices

use crate::session::UserNotice;
use tracing::{debug, warn};

const TITLE: &str = "vpnctl";

/// Show a notice as a desktop notification
///
/// Failures are logged; a missing notification daemon never breaks the
/// session.
pub fn show_notice(notice: &UserNotice) {
    show_notification(TITLE, &notice.to_string());
}

#[cfg(windows)]
fn show_notification(title: &str, message: &str) {
    use tauri_winrt_notification::{Duration, Toast};

    let result = Toast::new(Toast::POWERSHELL_APP_ID)
        .title(title)
        .text1(message)
        .duration(Duration::Short)
        .show();

    match result {
        Ok(()) => debug!("Notification shown: {}", message),
        Err(e) => warn!("Failed to show notification: {}", e),
    }
}

#[cfg(not(windows))]
fn show_notification(title: &str, message: &str) {
    let result = notify_rust::Notification::new()
        .summary(title)
        .body(message)
        .show();

    match result {
        Ok(_) => debug!("Notification shown: {}", message),
        Err(e) => warn!("Failed to show notification: {}", e),
    }
}
