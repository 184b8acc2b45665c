//! Run policies: host-supplied decisions about when `run` should stop.

use std::time::Instant;
use swing_abi::VatId;

/// What happened in one crank, as reported to a [`RunPolicy`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrankDetails {
    pub crank_number: u64,
    /// Run-queue event kind that drove the crank.
    pub kind: &'static str,
    pub vat: Option<VatId>,
    pub computrons: u64,
    /// Whether any vat delivery happened.
    pub delivered: bool,
}

/// Result of [`crate::Kernel::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub cranks: u64,
    pub has_more_work: bool,
    /// Vat whose crank ran out of computrons and was put back on the
    /// queue, when the policy chose [`Exhaustion::Pause`].
    pub paused: Option<VatId>,
}

/// How the run loop treats a crank that spent more than its vat's
/// computron limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Exhaustion {
    /// Unwind the crank and terminate the vat.
    #[default]
    Terminate,
    /// Unwind the crank, leave its event at the head of the queue, and
    /// stop the run.
    Pause,
}

/// Each hook returns whether the kernel should keep running.
pub trait RunPolicy {
    /// Asked before every crank, including the first.
    fn may_crank(&self) -> bool {
        true
    }


    fn vat_created(&mut self, details: &CrankDetails) -> bool {
        self.crank_complete(details)
    }

    fn crank_complete(&mut self, details: &CrankDetails) -> bool;

    fn crank_failed(&mut self, details: &CrankDetails) -> bool {
        self.crank_complete(details)
    }

    /// A crank that delivered nothing to any vat.
    fn empty_crank(&mut self, details: &CrankDetails) -> bool {
        let _ = details;
        true
    }

    fn resource_exhausted(&mut self, details: &CrankDetails) -> Exhaustion {
        let _ = details;
        Exhaustion::Terminate
    }
}

/// Run until the queues are empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForeverPolicy;

impl RunPolicy for ForeverPolicy {
    fn crank_complete(&mut self, _details: &CrankDetails) -> bool {
        true
    }
}

/// Run until the queues are empty, pausing instead of terminating a vat
/// that runs out of computrons.
#[derive(Clone, Copy, Debug, Default)]
pub struct PauseOnExhaustion;

impl RunPolicy for PauseOnExhaustion {
    fn crank_complete(&mut self, _details: &CrankDetails) -> bool {
        true
    }

    fn resource_exhausted(&mut self, _details: &CrankDetails) -> Exhaustion {
        Exhaustion::Pause
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CrankLimitPolicy {
    remaining: u64,
}

impl CrankLimitPolicy {
    pub fn new(max_cranks: u64) -> Self {
        Self { remaining: max_cranks }
    }

    fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining > 0
    }
}

impl RunPolicy for CrankLimitPolicy {
    fn may_crank(&self) -> bool {
        self.remaining > 0
    }

    fn crank_complete(&mut self, _details: &CrankDetails) -> bool {
        self.tick()
    }

    fn empty_crank(&mut self, _details: &CrankDetails) -> bool {
        self.tick()
    }
}

/// Stop once the computrons spent reach the budget.
#[derive(Clone, Copy, Debug)]
pub struct ComputronBudgetPolicy {
    remaining: u64,
}

impl ComputronBudgetPolicy {
    pub fn new(budget: u64) -> Self {
        Self { remaining: budget }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl RunPolicy for ComputronBudgetPolicy {
    fn may_crank(&self) -> bool {
        self.remaining > 0
    }

    fn crank_complete(&mut self, details: &CrankDetails) -> bool {
        self.remaining = self.remaining.saturating_sub(details.computrons);
        self.remaining > 0
    }
}

/// Stop after a wall-clock deadline.
#[derive(Clone, Copy, Debug)]
pub struct WallClockPolicy {
    deadline: Instant,
}

impl WallClockPolicy {
    pub fn new(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn for_duration(duration: std::time::Duration) -> Self {
        Self::new(Instant::now() + duration)
    }
}

impl RunPolicy for WallClockPolicy {
    fn crank_complete(&mut self, _details: &CrankDetails) -> bool {
        Instant::now() < self.deadline
    }
}

/// Keep running only while every inner policy agrees.
#[derive(Default)]
pub struct AllOf {
    policies: Vec<Box<dyn RunPolicy>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, policy: impl RunPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    fn all(&mut self, mut f: impl FnMut(&mut dyn RunPolicy) -> bool) -> bool {
        // every policy observes every crank, even after one says stop
        self.policies
            .iter_mut()
            .fold(true, |keep, policy| f(policy.as_mut()) && keep)
    }
}

impl RunPolicy for AllOf {
    fn may_crank(&self) -> bool {
        self.policies.iter().all(|p| p.may_crank())
    }

    fn vat_created(&mut self, details: &CrankDetails) -> bool {
        self.all(|p| p.vat_created(details))
    }

    fn crank_complete(&mut self, details: &CrankDetails) -> bool {
        self.all(|p| p.crank_complete(details))
    }

    fn crank_failed(&mut self, details: &CrankDetails) -> bool {
        self.all(|p| p.crank_failed(details))
    }

    fn empty_crank(&mut self, details: &CrankDetails) -> bool {
        self.all(|p| p.empty_crank(details))
    }

    /// Pause if any inner policy asks to.
    fn resource_exhausted(&mut self, details: &CrankDetails) -> Exhaustion {
        self.policies
            .iter_mut()
            .map(|p| p.resource_exhausted(details))
            .fold(Exhaustion::Terminate, |acc, choice| {
                if choice == Exhaustion::Pause { choice } else { acc }
            })
    }
}
