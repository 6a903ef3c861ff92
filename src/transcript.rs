//! Turn-based transcript aggregation
//!
//! Fragments accumulate per speaker in a turn buffer and are mirrored into the
//! speaker's open entry. A turn-complete finalizes every open entry and resets
//! both buffers. Finalized entries are never touched again.

use crate::events::Speaker;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

/// Accumulators for the turn in progress.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TurnBuffer {
    pub user: String,
    pub agent: String,
}

impl TurnBuffer {
    fn get_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Agent => &mut self.agent,
        }
    }

    pub fn get(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Agent => &self.agent,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.agent.is_empty()
    }

    fn clear(&mut self) {
        self.user.clear();
        self.agent.clear();
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAggregator {
    entries: Vec<TranscriptEntry>,
    turn: TurnBuffer,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn turn(&self) -> &TurnBuffer {
        &self.turn
    }

    /// Index of the entry still open for `speaker`, if any.
    fn open_entry(&self, speaker: Speaker) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|e| e.speaker == speaker && !e.is_final)
    }

    /// Apply a text fragment. Returns true when the transcript changed.
    pub fn on_fragment(&mut self, speaker: Speaker, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        let acc = self.turn.get_mut(speaker);
        acc.push_str(text);
        let acc = acc.clone();

        match self.entries.last_mut() {
            Some(last) if last.speaker == speaker && !last.is_final => {
                last.text = acc;
                true
            }
            _ if acc.trim().is_empty() => false,
            _ => {
                // A speaker whose open entry got buried under the other speaker's
                // entry keeps that entry open; the new one carries the full turn.
                if let Some(idx) = self.open_entry(speaker) {
                    self.entries.remove(idx);
                }
                self.entries.push(TranscriptEntry {
                    speaker,
                    text: acc,
                    is_final: false,
                });
                true
            }
        }
    }

    /// Finalize the open entries of every speaker with a non-empty turn.
    pub fn on_turn_complete(&mut self) -> Vec<TranscriptEntry> {
        let mut finalized = Vec::new();
        for speaker in [Speaker::User, Speaker::Agent] {
            let acc = self.turn.get(speaker).to_string();
            let idx = self.open_entry(speaker);
            if acc.trim().is_empty() {
                if let Some(idx) = idx {
                    self.entries.remove(idx);
                }
                continue;
            }
            if let Some(idx) = idx {
                let entry = &mut self.entries[idx];
                entry.text = acc;
                entry.is_final = true;
                finalized.push(entry.clone());
            }
        }
        self.turn.clear();
        finalized
    }

    /// Drop everything; called when a new call starts.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.turn.clear();
    }
}
