//! Reshapes a raw call transcript into the two-party view shown to the judge.
//!
//! The voice assistant we configure plays the human side of the call, so its
//! `assistant` turns are labeled `user`, and everything the agent under test
//! says is labeled `AI`. System turns are dropped from the view. The stored
//! transcript is never rewritten.

use std::fmt;

use serde::Serialize;

use crate::model::{TranscriptTurn, TurnRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Speaker {
    #[serde(rename = "AI")]
    Ai,
    #[serde(rename = "user")]
    User,
}

impl Speaker {
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::Ai => "AI",
            Speaker::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewTurn {
    pub role: Speaker,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EvaluatorView {
    turns: Vec<ViewTurn>,
}

impl EvaluatorView {
    pub fn turns(&self) -> &[ViewTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// No conversational turns survived; there is nothing to evaluate.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl fmt::Display for EvaluatorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for turn in &self.turns {
            writeln!(f, "{}: {}", turn.role.label(), turn.content.trim())?;
        }
        Ok(())
    }
}

pub fn normalize(raw_turns: &[TranscriptTurn]) -> EvaluatorView {
    let turns = raw_turns
        .iter()
        .filter(|turn| !turn.role.is_system())
        .map(|turn| ViewTurn {
            role: speaker_for(&turn.role),
            content: turn.content.clone(),
        })
        .collect();

    EvaluatorView { turns }
}

fn speaker_for(role: &TurnRole) -> Speaker {
    match role {
        TurnRole::Assistant => Speaker::User,
        _ => Speaker::Ai,
    }
}
