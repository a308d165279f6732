use super::gate::{Badge, Notification, Urgency};

/// Where rendered notifications and the badge end up
pub trait Notifier: Send + Sync {
    fn show(&self, notification: &Notification);
    fn dismiss(&self, id: &str);
    fn set_badge(&self, badge: &Badge);
}

/// Prints notifications to stdout, for `listen` in a terminal
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self
    }
}

impl Notifier for ConsoleNotifier {
    fn show(&self, notification: &Notification) {
        let marker = match notification.urgency {
            Urgency::High => "!!",
            Urgency::Normal => "--",
        };
        println!(
            "{} [{}] {}: {} ({})",
            marker, notification.kind, notification.title, notification.message, notification.id
        );
    }

    fn dismiss(&self, id: &str) {
        tracing::debug!("Notification dismissed: {}", id);
    }

    fn set_badge(&self, badge: &Badge) {
        // 端末ではバッジ表示の代わりにログのみ
        tracing::debug!(text = %badge.text, color = badge.color, "Badge updated");
    }
}
