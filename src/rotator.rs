/// Interleaves custom activity messages with the real price activity.
///
/// Each message is shown on two consecutive ticks before the cursor moves
/// on, and the real activity gets one tick once the list is exhausted.
pub struct ActivityRotator {
    messages: Vec<String>,
    cursor: usize,
    parity: u64,
}

impl ActivityRotator {
    pub fn new(messages: Vec<String>) -> ActivityRotator {
        ActivityRotator {
            messages,
            cursor: 0,
            parity: 0,
        }
    }

    /// Returns the custom message to show this tick, or `None` when the real
    /// activity should be shown.
    pub fn next(&mut self) -> Option<&str> {
        if self.messages.is_empty() {
            return None;
        }
        if self.cursor == self.messages.len() {
            self.cursor = 0;
            self.parity = 0;
            return None;
        }
        let shown = self.cursor;
        if self.parity % 2 == 1 {
            self.cursor += 1;
        }
        self.parity += 1;
        Some(&self.messages[shown])
    }

    /// Picks the text for this tick.
    pub fn activity(&mut self, real: String) -> String {
        match self.next() {
            Some(custom) => custom.to_owned(),
            None => real,
        }
    }
}
