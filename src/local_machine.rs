//! Local command executor.
//!
//! [`LocalMachine`] is the execution endpoint for commands arriving from
//! the peer: it translates protocol payloads into host actions, gated by a
//! mute flag for everything audible. The actual host subsystems (speech,
//! tones, braille hardware, input injection, clipboard) live behind the
//! [`HostBridge`] trait: the host application plugs in the real thing,
//! the bundled [`LoggingBridge`] serves headless runs, and tests use a
//! recording double.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

/// Seam to the host application's output and input subsystems.
///
/// Implementations must be cheap to call; commands arrive on the
/// orchestrator's event loop and must not stall it.
pub trait HostBridge: Send + Sync {
    /// Speak a speech sequence from the peer.
    fn speak(&self, sequence: &Value);
    fn cancel_speech(&self);
    fn pause_speech(&self, switch: bool);
    fn beep(&self, hz: f64, length_ms: u64, left: u64, right: u64);
    fn play_wave(&self, name: &str);
    /// Inject a keyboard event into the local system.
    fn send_key(&self, vk_code: Option<u64>, extended: bool, pressed: bool);
    fn set_clipboard_text(&self, text: &str);
    /// Trigger the secure attention sequence; may fail without privileges.
    fn send_sas(&self) -> Result<()>;
    /// Cell count of the local braille display; 0 when none is connected.
    fn braille_display_size(&self) -> usize;
    fn write_braille_cells(&self, cells: &[u8]);
    /// Execute a braille input gesture (routing key, braille keyboard).
    fn braille_input(&self, gesture: &Value);
    /// Show a message to the local user.
    fn message(&self, text: &str);
}

/// Bridge that logs every action. Used by the headless CLI.
pub struct LoggingBridge;

impl HostBridge for LoggingBridge {
    fn speak(&self, sequence: &Value) {
        log::info!("[local] speak: {sequence}");
    }
    fn cancel_speech(&self) {
        log::info!("[local] cancel speech");
    }
    fn pause_speech(&self, switch: bool) {
        log::info!("[local] pause speech: {switch}");
    }
    fn beep(&self, hz: f64, length_ms: u64, left: u64, right: u64) {
        log::info!("[local] beep {hz} Hz for {length_ms} ms ({left}/{right})");
    }
    fn play_wave(&self, name: &str) {
        log::info!("[local] play wave {name}");
    }
    fn send_key(&self, vk_code: Option<u64>, extended: bool, pressed: bool) {
        log::info!("[local] key vk={vk_code:?} extended={extended} pressed={pressed}");
    }
    fn set_clipboard_text(&self, text: &str) {
        log::info!("[local] clipboard set ({} chars)", text.chars().count());
    }
    fn send_sas(&self) -> Result<()> {
        log::info!("[local] secure attention sequence");
        Ok(())
    }
    fn braille_display_size(&self) -> usize {
        0
    }
    fn write_braille_cells(&self, cells: &[u8]) {
        log::debug!("[local] braille cells: {}", cells.len());
    }
    fn braille_input(&self, gesture: &Value) {
        log::info!("[local] braille input: {gesture}");
    }
    fn message(&self, text: &str) {
        log::info!("[local] {text}");
    }
}

/// Executes peer commands against the local system.
///
/// The mute flag silences audible output (speech, tones, waves) while
/// keeping the connection and input handling alive. Braille sharing state
/// lives here too: while `receiving_braille` is set, the local display
/// shows the peer's cells and the local driver's own output is suppressed.
pub struct LocalMachine {
    bridge: Arc<dyn HostBridge>,
    muted: bool,
    receiving_braille: bool,
    /// Braille display sizes reported by remote machines, for negotiation.
    cached_sizes: Vec<i64>,
}

impl LocalMachine {
    pub fn new(bridge: Arc<dyn HostBridge>) -> Self {
        Self {
            bridge,
            muted: false,
            receiving_braille: false,
            cached_sizes: Vec::new(),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn receiving_braille(&self) -> bool {
        self.receiving_braille
    }

    pub fn set_receiving_braille(&mut self, receiving: bool) {
        self.receiving_braille = receiving;
    }

    pub fn bridge(&self) -> &Arc<dyn HostBridge> {
        &self.bridge
    }

    // ── Audible output, gated by mute ───────────────────────────────────

    pub fn speak(&self, sequence: &Value) {
        if self.muted {
            return;
        }
        self.bridge.speak(sequence);
    }

    pub fn cancel_speech(&self) {
        if self.muted {
            return;
        }
        self.bridge.cancel_speech();
    }

    pub fn pause_speech(&self, switch: bool) {
        if self.muted {
            return;
        }
        self.bridge.pause_speech(switch);
    }

    pub fn beep(&self, hz: f64, length_ms: u64, left: u64, right: u64) {
        if self.muted {
            return;
        }
        self.bridge.beep(hz, length_ms, left, right);
    }

    pub fn play_wave(&self, name: &str) {
        if self.muted {
            return;
        }
        self.bridge.play_wave(name);
    }

    // ── Input and system commands ───────────────────────────────────────

    pub fn send_key(&self, vk_code: Option<u64>, extended: bool, pressed: bool) {
        self.bridge.send_key(vk_code, extended, pressed);
    }

    pub fn set_clipboard_text(&self, text: &str) {
        self.bridge.set_clipboard_text(text);
    }

    /// Trigger the secure attention sequence. A failure (typically missing
    /// privileges) is reported to the local user, never to the peer.
    pub fn send_sas(&self) {
        if let Err(e) = self.bridge.send_sas() {
            log::warn!("[local] cannot trigger secure attention sequence: {e:#}");
            self.bridge
                .message("No permission on device to trigger the secure attention sequence");
        }
    }

    // ── Braille sharing ─────────────────────────────────────────────────

    /// Write cells pushed by the peer to the local display.
    ///
    /// Cells are written only while receiving is enabled, a display is
    /// connected, and the push fits; a push longer than the local display
    /// is dropped outright, a shorter one is padded with blank cells.
    pub fn display(&self, cells: &[u8]) {
        let size = self.bridge.braille_display_size();
        if !self.receiving_braille || size == 0 || cells.len() > size {
            return;
        }
        let mut padded = cells.to_vec();
        padded.resize(size, 0);
        self.bridge.write_braille_cells(&padded);
    }

    /// Execute a braille input gesture from the peer. Gestures with no
    /// local binding are a no-op in the bridge, never an error.
    pub fn braille_input(&self, gesture: &Value) {
        self.bridge.braille_input(gesture);
    }

    /// Cache display sizes reported by remote machines.
    pub fn set_braille_display_sizes(&mut self, sizes: Vec<i64>) {
        self.cached_sizes = sizes;
    }

    /// Negotiated display size: the smallest positive size among the
    /// local value and every cached remote size, so the narrower of two
    /// paired displays governs layout.
    pub fn filter_display_size(&self, local: i64) -> i64 {
        self.cached_sizes
            .iter()
            .copied()
            .chain(std::iter::once(local))
            .filter(|size| *size > 0)
            .min()
            .unwrap_or(local)
    }

    /// Whether the local braille driver should stay active: suppressed
    /// while this endpoint is showing remote cells, so the physical
    /// display never mixes two sources.
    pub fn decide_braille_enabled(&self) -> bool {
        !self.receiving_braille
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingBridge;
    use super::*;

    fn machine(bridge: &Arc<RecordingBridge>) -> LocalMachine {
        LocalMachine::new(Arc::clone(bridge) as Arc<dyn HostBridge>)
    }

    #[test]
    fn test_mute_silences_audio_but_not_input() {
        let bridge = Arc::new(RecordingBridge::default());
        let mut machine = machine(&bridge);
        machine.set_muted(true);

        machine.beep(440.0, 100, 50, 50);
        machine.speak(&serde_json::json!(["hello"]));
        machine.play_wave("connected");
        machine.cancel_speech();
        machine.send_key(Some(65), false, true);
        machine.set_clipboard_text("text");

        assert_eq!(
            bridge.calls(),
            vec!["key:Some(65):false:true", "clipboard:text"],
            "only non-audible commands execute while muted"
        );
    }

    #[test]
    fn test_display_pads_short_push_to_display_size() {
        let bridge = Arc::new(RecordingBridge {
            display_size: 8,
            ..Default::default()
        });
        let mut machine = machine(&bridge);
        machine.set_receiving_braille(true);

        machine.display(&[1, 2, 3]);
        let cells = bridge.cells.lock().unwrap();
        assert_eq!(cells.as_slice(), [[1, 2, 3, 0, 0, 0, 0, 0].to_vec()]);
    }

    #[test]
    fn test_display_drops_push_longer_than_display() {
        let bridge = Arc::new(RecordingBridge {
            display_size: 4,
            ..Default::default()
        });
        let mut machine = machine(&bridge);
        machine.set_receiving_braille(true);

        machine.display(&[1, 2, 3, 4, 5]);
        assert!(bridge.cells.lock().unwrap().is_empty(), "dropped, not truncated");
    }

    #[test]
    fn test_display_inactive_unless_receiving() {
        let bridge = Arc::new(RecordingBridge {
            display_size: 8,
            ..Default::default()
        });
        let machine = machine(&bridge);

        machine.display(&[1, 2, 3]);
        assert!(bridge.cells.lock().unwrap().is_empty());
    }

    #[test]
    fn test_filter_display_size_picks_smallest_positive() {
        let bridge = Arc::new(RecordingBridge::default());
        let mut machine = machine(&bridge);

        machine.set_braille_display_sizes(vec![40, 0, 14]);
        assert_eq!(machine.filter_display_size(20), 14);
        assert_eq!(machine.filter_display_size(12), 12);

        machine.set_braille_display_sizes(vec![]);
        assert_eq!(machine.filter_display_size(0), 0, "no positive size known");
        assert_eq!(machine.filter_display_size(18), 18);
    }

    #[test]
    fn test_local_braille_suppressed_while_receiving() {
        let bridge = Arc::new(RecordingBridge::default());
        let mut machine = machine(&bridge);

        assert!(machine.decide_braille_enabled());
        machine.set_receiving_braille(true);
        assert!(!machine.decide_braille_enabled());
    }

    #[test]
    fn test_sas_failure_is_reported_locally() {
        let bridge = Arc::new(RecordingBridge {
            sas_fails: true,
            ..Default::default()
        });
        let machine = machine(&bridge);

        machine.send_sas();
        let calls = bridge.calls();
        assert_eq!(calls[0], "sas");
        assert!(calls[1].starts_with("message:"), "failure surfaces to the local user");
    }
}
