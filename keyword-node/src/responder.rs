/// Command responder
///
/// Acts on recognized commands. The bundled `SwitchResponder` drives a
/// single on/off output.

use crate::config::ModelSettings;
use tracing::{info, warn};

/// Fire-and-forget reaction to a recognized command
pub trait Responder: Send {
    fn respond(&mut self, category: &str);
}

/// Labels the switch reacts to
#[derive(Debug, Clone)]
pub struct SwitchLabels {
    pub on: String,
    pub off: String,
    pub help: String,
}

impl Default for SwitchLabels {
    fn default() -> Self {
        Self {
            on: "enciende".to_string(),
            off: "apaga".to_string(),
            help: "socorro".to_string(),
        }
    }
}

/// On/off switch controlled by voice commands
pub struct SwitchResponder {
    labels: SwitchLabels,
    wake_word: Option<String>,
    on: bool,
    alerts: u64,
}

impl SwitchResponder {
    pub fn new(settings: &ModelSettings) -> Self {
        Self::with_labels(settings, SwitchLabels::default())
    }

    pub fn with_labels(settings: &ModelSettings, labels: SwitchLabels) -> Self {
        Self {
            labels,
            wake_word: settings.label(settings.wake_word_index).map(str::to_string),
            on: false,
            alerts: 0,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Help requests seen so far
    pub fn alerts(&self) -> u64 {
        self.alerts
    }
}

impl Responder for SwitchResponder {
    fn respond(&mut self, category: &str) {
        info!("Responding to command: {}", category);

        if self.wake_word.as_deref() == Some(category) {
            return;
        }

        if category == self.labels.on {
            if !self.on {
                info!("Switch on");
                self.on = true;
            }
        } else if category == self.labels.off {
            if self.on {
                info!("Switch off");
                self.on = false;
            }
        } else if category == self.labels.help {
            self.alerts += 1;
            warn!("Help requested ({} so far)", self.alerts);
        } else {
            warn!("Received unknown command {}", category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_on_off_idempotent() {
        let mut switch = SwitchResponder::new(&ModelSettings::default());
        assert!(!switch.is_on());

        switch.respond("enciende");
        switch.respond("enciende");
        assert!(switch.is_on());

        switch.respond("apaga");
        assert!(!switch.is_on());
        switch.respond("apaga");
        assert!(!switch.is_on());
    }

    #[test]
    fn test_wake_word_and_unknown_ignored() {
        let mut switch = SwitchResponder::new(&ModelSettings::default());

        switch.respond("heylola");
        switch.respond("abre");
        assert!(!switch.is_on());
        assert_eq!(switch.alerts(), 0);
    }

    #[test]
    fn test_help_counts_alerts() {
        let mut switch = SwitchResponder::new(&ModelSettings::default());
        switch.respond("enciende");
        switch.respond("socorro");
        switch.respond("socorro");

        assert_eq!(switch.alerts(), 2);
        assert!(switch.is_on());
    }
}
