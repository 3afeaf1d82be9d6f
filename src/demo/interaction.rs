//! Volley targeting, a local multi-step interaction.

use crate::demo::{SkirmishCommand, SkirmishState, MAX_VOLLEY_POWER, MAX_VOLLEY_TARGETS};
use crate::game::state::PlayerId;
use crate::sync::interaction::{InteractionDeclaration, InteractionError};

/// One click while aiming a volley.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolleyStep {
    /// Add or remove a target.
    Toggle(PlayerId),
    /// Set per-target power.
    Power(u32),
}

/// Work-in-progress volley.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolleyDraft {
    /// Chosen targets, in click order
    pub targets: Vec<PlayerId>,
    /// Per-target power
    pub power: u32,
}

/// Choose up to three targets, then fire one `VOLLEY`.
#[derive(Debug, Clone)]
pub struct VolleyTargeting {
    attacker: PlayerId,
    living: Vec<PlayerId>,
}

impl VolleyTargeting {
    /// Aim as `attacker` against the fighters alive in `state`.
    pub fn new(attacker: PlayerId, state: &SkirmishState) -> Self {
        Self { attacker, living: state.alive() }
    }
}

impl InteractionDeclaration for VolleyTargeting {
    type Draft = VolleyDraft;
    type Step = VolleyStep;
    type Command = SkirmishCommand;

    fn interaction_id(&self) -> &'static str {
        "volley_targeting"
    }

    fn seed(&self) -> VolleyDraft {
        VolleyDraft { targets: Vec::new(), power: 1 }
    }

    fn reduce(&self, draft: &VolleyDraft, step: VolleyStep) -> Result<VolleyDraft, InteractionError> {
        let mut next = draft.clone();
        match step {
            VolleyStep::Toggle(target) => {
                if target == self.attacker {
                    return Err(InteractionError::StepRefused("cannot target yourself".into()));
                }
                if !self.living.contains(&target) {
                    return Err(InteractionError::StepRefused("target is not in the fight".into()));
                }
                if let Some(i) = next.targets.iter().position(|t| *t == target) {
                    next.targets.remove(i);
                } else if next.targets.len() == MAX_VOLLEY_TARGETS {
                    return Err(InteractionError::StepRefused("too many targets".into()));
                } else {
                    next.targets.push(target);
                }
            }
            VolleyStep::Power(power) => {
                if !(1..=MAX_VOLLEY_POWER).contains(&power) {
                    return Err(InteractionError::StepRefused(format!("power must be 1..={}", MAX_VOLLEY_POWER)));
                }
                next.power = power;
            }
        }
        Ok(next)
    }

    fn finalize(&self, draft: VolleyDraft) -> SkirmishCommand {
        SkirmishCommand::Volley { targets: draft.targets, power: draft.power }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;
    use crate::demo::Skirmish;
    use crate::game::domain::DomainCore;
    use crate::sync::interaction::{InteractionPhase, LocalInteractionManager};

    const ALICE: PlayerId = PlayerId::from_seat(1);
    const BOB: PlayerId = PlayerId::from_seat(2);
    const CAROL: PlayerId = PlayerId::from_seat(3);

    fn three_way() -> SkirmishState {
        Skirmish.setup(&[ALICE, BOB, CAROL], &mut DeterministicRng::new(1))
    }

    #[test]
    fn test_toggle_and_commit() {
        let state = three_way();
        let mut manager = LocalInteractionManager::new();
        manager.begin(VolleyTargeting::new(ALICE, &state));

        manager.update(VolleyStep::Toggle(BOB)).unwrap();
        manager.update(VolleyStep::Toggle(CAROL)).unwrap();
        manager.update(VolleyStep::Toggle(BOB)).unwrap();
        manager.update(VolleyStep::Power(3)).unwrap();

        assert_eq!(
            manager.commit().unwrap(),
            SkirmishCommand::Volley { targets: vec![CAROL], power: 3 }
        );
        assert_eq!(manager.phase(), InteractionPhase::Idle);
    }

    #[test]
    fn test_self_target_cancels() {
        let state = three_way();
        let mut manager = LocalInteractionManager::new();
        manager.begin(VolleyTargeting::new(ALICE, &state));
        manager.update(VolleyStep::Toggle(BOB)).unwrap();

        let err = manager.update(VolleyStep::Toggle(ALICE)).unwrap_err();
        assert_eq!(err, InteractionError::StepRefused("cannot target yourself".into()));
        assert!(!manager.is_active());
    }

    #[test]
    fn test_power_bounds() {
        let targeting = VolleyTargeting::new(ALICE, &three_way());
        let draft = targeting.seed();

        assert!(targeting.reduce(&draft, VolleyStep::Power(0)).is_err());
        assert!(targeting.reduce(&draft, VolleyStep::Power(MAX_VOLLEY_POWER + 1)).is_err());
        assert_eq!(targeting.reduce(&draft, VolleyStep::Power(MAX_VOLLEY_POWER)).unwrap().power, MAX_VOLLEY_POWER);
    }
}
