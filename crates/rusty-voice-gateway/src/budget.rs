//! Per-session budget, checked before every generation.

use rusty_voice_core::config::BudgetConfig;
use rusty_voice_core::error::{Result, VoiceError};
use rusty_voice_core::session::{Role, Session};

pub trait BudgetGuard: Send + Sync {
    /// `Err(BudgetExceeded)` stops the turn before any generation starts.
    fn check(&self, session: &Session) -> Result<()>;
}

/// Never refuses.
#[derive(Debug, Default)]
pub struct Unlimited;

impl BudgetGuard for Unlimited {
    fn check(&self, _session: &Session) -> Result<()> {
        Ok(())
    }
}

/// Caps the number of assistant turns in a session.
#[derive(Debug, Clone, Copy)]
pub struct TurnBudget {
    max_turns: u32,
}

impl TurnBudget {
    pub fn new(max_turns: u32) -> Self {
        Self { max_turns }
    }
}

impl BudgetGuard for TurnBudget {
    fn check(&self, session: &Session) -> Result<()> {
        let taken = session
            .turns()
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .count();
        if taken >= self.max_turns as usize {
            return Err(VoiceError::BudgetExceeded(format!(
                "turn limit of {} reached",
                self.max_turns
            )));
        }
        Ok(())
    }
}

/// Caps provider-reported tokens across the session.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    max_tokens: u64,
}

impl TokenBudget {
    pub fn new(max_tokens: u64) -> Self {
        Self { max_tokens }
    }
}

impl BudgetGuard for TokenBudget {
    fn check(&self, session: &Session) -> Result<()> {
        let used = session.metrics.tokens_used;
        if used >= self.max_tokens {
            return Err(VoiceError::BudgetExceeded(format!(
                "token limit of {} reached ({used} used)",
                self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Refuses when any inner guard refuses; the first refusal wins.
pub struct AllOf(Vec<Box<dyn BudgetGuard>>);

impl BudgetGuard for AllOf {
    fn check(&self, session: &Session) -> Result<()> {
        self.0.iter().try_for_each(|guard| guard.check(session))
    }
}

/// The guard described by `config`.
pub fn from_config(config: &BudgetConfig) -> Box<dyn BudgetGuard> {
    let mut guards: Vec<Box<dyn BudgetGuard>> = Vec::new();
    if let Some(max) = config.max_turns_per_session {
        guards.push(Box::new(TurnBudget::new(max)));
    }
    if let Some(max) = config.max_tokens_per_session {
        guards.push(Box::new(TokenBudget::new(max)));
    }
    match guards.len() {
        0 => Box::new(Unlimited),
        1 => guards.remove(0),
        _ => Box::new(AllOf(guards)),
    }
}

#[cfg(test)]
mod tests {
    use rusty_voice_core::session::Turn;

    use super::*;

    #[test]
    fn test_turn_budget_counts_assistant_turns() {
        let guard = TurnBudget::new(1);
        let mut session = Session::new();
        assert!(guard.check(&session).is_ok());

        session.append_turn(Turn::user("hello"));
        assert!(guard.check(&session).is_ok());

        session.append_turn(Turn::assistant("hi"));
        let err = guard.check(&session).unwrap_err();
        assert_eq!(err.code(), "budget_exceeded");
    }

    #[test]
    fn test_zero_budget_refuses_first_turn() {
        assert!(TurnBudget::new(0).check(&Session::new()).is_err());
    }

    #[test]
    fn test_token_budget() {
        let guard = TokenBudget::new(500);
        let mut session = Session::new();
        session.metrics.tokens_used = 499;
        assert!(guard.check(&session).is_ok());

        session.metrics.tokens_used = 500;
        let err = guard.check(&session).unwrap_err();
        assert!(err.to_string().contains("token limit of 500"));
    }

    #[test]
    fn test_from_config() {
        let unlimited = from_config(&BudgetConfig::default());
        assert!(unlimited.check(&Session::new()).is_ok());

        let capped = from_config(&BudgetConfig {
            max_turns_per_session: Some(0),
            ..BudgetConfig::default()
        });
        assert!(capped.check(&Session::new()).is_err());
    }

    #[test]
    fn test_from_config_combines_limits() {
        let guard = from_config(&BudgetConfig {
            max_turns_per_session: Some(10),
            max_tokens_per_session: Some(100),
        });
        let mut session = Session::new();
        assert!(guard.check(&session).is_ok());

        session.metrics.tokens_used = 150;
        assert!(guard.check(&session).is_err());
    }
}
