//! Reflash state machine

use std::fmt;

/// Phase of a reflash run
///
/// ```text
/// Idle -> PreProgram -> DownloadBoot -> ActivateBoot -> DownloadApplication -> PostProgram -> Done
///   \__________\_____________\______________\_________________\____________________\-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflashState {
    Idle,
    PreProgram,
    DownloadBoot,
    ActivateBoot,
    DownloadApplication,
    PostProgram,
    Done,
    Failed,
}

impl ReflashState {
    /// The single transition function
    ///
    /// A successful phase moves to its successor, a failed one to `Failed`.
    /// `Done` and `Failed` are absorbing: a failed run restarts from a new
    /// `Idle` machine, never from where it stopped.
    pub fn next(self, outcome: Result<(), ()>) -> Self {
        use ReflashState::*;

        match (self, outcome) {
            (Done, _) => Done,
            (Failed, _) => Failed,
            (_, Err(())) => Failed,
            (Idle, Ok(())) => PreProgram,
            (PreProgram, Ok(())) => DownloadBoot,
            (DownloadBoot, Ok(())) => ActivateBoot,
            (ActivateBoot, Ok(())) => DownloadApplication,
            (DownloadApplication, Ok(())) => PostProgram,
            (PostProgram, Ok(())) => Done,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl Default for ReflashState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for ReflashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PreProgram => "pre-programming",
            Self::DownloadBoot => "boot download",
            Self::ActivateBoot => "boot activation",
            Self::DownloadApplication => "application download",
            Self::PostProgram => "post-programming",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL: [ReflashState; 8] = [
        ReflashState::Idle,
        ReflashState::PreProgram,
        ReflashState::DownloadBoot,
        ReflashState::ActivateBoot,
        ReflashState::DownloadApplication,
        ReflashState::PostProgram,
        ReflashState::Done,
        ReflashState::Failed,
    ];

    #[test]
    fn test_happy_path_order() {
        let mut state = ReflashState::Idle;
        let mut visited = vec![state];
        while !state.is_terminal() {
            state = state.next(Ok(()));
            visited.push(state);
        }

        assert_eq!(visited, ALL[..7].to_vec());
    }

    #[test]
    fn test_every_non_terminal_state_can_fail() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            assert_eq!(state.next(Err(())), ReflashState::Failed, "from {:?}", state);
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        for outcome in [Ok(()), Err(())] {
            assert_eq!(ReflashState::Done.next(outcome), ReflashState::Done);
            assert_eq!(ReflashState::Failed.next(outcome), ReflashState::Failed);
        }
    }
}
