use super::*;

/// Everything a crank's dispatch produced, evaluated once the event has
/// been handled.
#[derive(Debug, Default)]
pub(crate) struct CrankResults {
    /// Vat that received a delivery, if any.
    pub vat: Option<VatId>,
    pub delivered: bool,
    pub computrons: u64,
    pub illegal: Option<String>,
    pub delivery_error: Option<String>,
    pub over_budget: bool,
    pub exit: Option<(bool, CapData<KernelSlot>)>,
}

impl CrankResults {
    /// Reason to unwind the crank, in precedence order: illegal syscall,
    /// failed delivery, metering overrun.
    pub(crate) fn abort_reason(&self) -> Option<String> {
        if let Some(message) = &self.illegal {
            return Some(format!("illegal syscall: {message}"));
        }
        if let Some(message) = &self.delivery_error {
            return Some(format!("delivery failed: {message}"));
        }
        if self.over_budget {
            return Some(format!("crank exceeded its computron limit ({} used)", self.computrons));
        }
        None
    }

    pub(crate) fn aborted(&self) -> bool {
        self.illegal.is_some() || self.delivery_error.is_some() || self.over_budget
    }

    /// The metering overrun is the only thing wrong with the crank.
    fn exhausted_only(&self) -> bool {
        self.over_budget && self.illegal.is_none() && self.delivery_error.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CrankOutcome {
    Complete,
    VatCreated,
    Failed,
    /// Unwound without a trace; the event is still queued.
    Paused,
}

struct CrankReport {
    details: CrankDetails,
    outcome: CrankOutcome,
}

impl Kernel {
    /// Run at most one crank. Returns whether work remains afterwards.
    pub fn step(&mut self) -> Result<bool, KernelError> {
        self.crank(&mut ForeverPolicy)?;
        self.has_work()
    }

    /// Run cranks until the queues drain or the policy says stop.
    pub fn run(&mut self, policy: &mut dyn RunPolicy) -> Result<RunOutcome, KernelError> {
        self.check_usable()?;
        let mut cranks = 0;
        let mut paused = None;
        while policy.may_crank() {
            let Some(report) = self.crank(policy)? else {
                break;
            };
            let details = &report.details;
            if report.outcome == CrankOutcome::Paused {
                paused = details.vat;
                break;
            }
            cranks += 1;
            let keep_going = match report.outcome {
                CrankOutcome::Paused => false,
                CrankOutcome::Failed => policy.crank_failed(details),
                CrankOutcome::VatCreated => policy.vat_created(details),
                CrankOutcome::Complete if !details.delivered => policy.empty_crank(details),
                CrankOutcome::Complete => policy.crank_complete(details),
            };
            if !keep_going {
                break;
            }
        }
        Ok(RunOutcome {
            cranks,
            has_more_work: self.has_work()?,
            paused,
        })
    }

    fn crank(&mut self, policy: &mut dyn RunPolicy) -> Result<Option<CrankReport>, KernelError> {
        self.check_usable()?;
        self.cranking = true;
        let result = self.crank_inner(policy);
        self.cranking = false;
        result.map_err(|err| {
            let message = err.to_string();
            log::error!("kernel panic: {message}");
            self.panicked = Some(message.clone());
            self.keeper.store_mut().discard_pending();
            self.keeper.maybe_free.clear();
            self.warehouse.evict_all();
            match err {
                KernelError::Panic(_) => err,
                _ => KernelError::Panic(message),
            }
        })
    }

    /// Pending GC work first, then scheduled reaps, then the run queue.
    fn select_event(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        if let Some(event) = self.keeper.next_gc_event()? {
            return Ok(Some(event));
        }
        if let Some(vat) = self.keeper.next_reap()? {
            return Ok(Some(RunQueueEvent::BringOutYourDead { vat }));
        }
        self.keeper.dequeue()
    }

    fn crank_inner(&mut self, policy: &mut dyn RunPolicy) -> Result<Option<CrankReport>, KernelError> {
        let pending_free = self.keeper.maybe_free.clone();
        self.keeper.store_mut().start_crank()?;
        self.keeper.store_mut().establish_savepoint("start")?;
        let Some(event) = self.select_event()? else {
            self.keeper.store_mut().rollback_to("start")?;
            self.keeper.store_mut().end_crank()?;
            return Ok(None);
        };
        log::debug!("crank {}: {}", self.keeper.crank_number()? + 1, event.kind());
        self.keeper.store_mut().establish_savepoint("deliver")?;

        let mut results = CrankResults::default();
        self.process_event(&event, &mut results)?;
        if let Some(vat) = results.vat {
            if results.delivered && !results.aborted() && results.exit.is_none() {
                self.after_delivery(vat, &event)?;
            }
        }

        if let (Some(vat), true) = (results.vat, results.exhausted_only()) {
            let details = CrankDetails {
                crank_number: self.keeper.crank_number()? + 1,
                kind: event.kind(),
                vat: Some(vat),
                computrons: results.computrons,
                delivered: results.delivered,
            };
            if policy.resource_exhausted(&details) == Exhaustion::Pause {
                log::warn!("{vat} ran out of computrons; pausing with its {} still queued", event.kind());
                self.warehouse.evict(vat);
                self.keeper.maybe_free = pending_free;
                self.keeper.store_mut().rollback_to("start")?;
                self.keeper.store_mut().end_crank()?;
                return Ok(Some(CrankReport {
                    details,
                    outcome: CrankOutcome::Paused,
                }));
            }
        }

        let mut outcome = CrankOutcome::Complete;
        match (results.abort_reason(), results.vat.or(event.vat())) {
            (Some(reason), Some(vat)) => {
                outcome = CrankOutcome::Failed;
                self.abort_crank(vat, &event, &reason, pending_free)?;
            }
            (Some(reason), None) => {
                return Err(KernelError::panic(format!("crank failed without a vat: {reason}")));
            }
            (None, vat) => {
                self.keeper.release_event(&event)?;
                if let (Some(vat), Some((failure, info))) = (vat, results.exit.take()) {
                    log::info!("{vat} exited (failure: {failure})");
                    self.note_lifecycle_success(&event)?;
                    self.terminate_vat_now(vat, failure, info)?;
                } else if self.note_lifecycle_success(&event)? {
                    outcome = CrankOutcome::VatCreated;
                }
            }
        }

        self.keeper.process_refcounts()?;
        let crank_number = self.keeper.increment_crank_number()?;
        crate::stats::record_dispatch(&mut self.keeper, event.kind(), results.delivered)?;
        let hashes = self.keeper.store_mut().emit_crank_hashes()?;
        self.keeper.store_mut().end_crank()?;
        log::debug!("crank {crank_number} done, activity {}", hashes.activity);

        Ok(Some(CrankReport {
            details: CrankDetails {
                crank_number,
                kind: event.kind(),
                vat: results.vat.or(event.vat()),
                computrons: results.computrons,
                delivered: results.delivered,
            },
            outcome,
        }))
    }

    /// Unwind a failed crank and terminate the vat that caused it. A failed
    /// send goes back on the queue so it can be rejected against the dead
    /// vat; every other event is consumed.
    fn abort_crank(
        &mut self,
        vat: VatId,
        event: &RunQueueEvent,
        reason: &str,
        pending_free: BTreeSet<KernelSlot>,
    ) -> Result<(), KernelError> {
        log::warn!("{vat} crank aborted: {reason}");
        self.warehouse.evict(vat);
        self.keeper.maybe_free = pending_free;
        if matches!(event, RunQueueEvent::Send { .. }) {
            self.keeper.store_mut().rollback_to("start")?;
        } else {
            self.keeper.store_mut().rollback_to("deliver")?;
            self.keeper.release_event(event)?;
        }
        match event {
            RunQueueEvent::CreateVat { vat, .. } => self.lifecycle.push(LifecycleEvent::VatCreateFailed {
                vat: *vat,
                error: reason.to_string(),
            }),
            RunQueueEvent::UpgradeVat { vat, upgrade_id, .. } => {
                self.lifecycle.push(LifecycleEvent::VatUpgradeFailed {
                    vat: *vat,
                    upgrade_id: *upgrade_id,
                    error: reason.to_string(),
                })
            }
            _ => {}
        }
        if self.keeper.is_vat_alive(vat)? {
            self.terminate_vat_now(vat, true, CapData::error(reason))?;
        }
        Ok(())
    }

    /// Record the lifecycle event of a successful create or upgrade crank.
    fn note_lifecycle_success(&mut self, event: &RunQueueEvent) -> Result<bool, KernelError> {
        match event {
            RunQueueEvent::CreateVat { vat, options, .. } if self.keeper.is_vat_alive(*vat)? => {
                log::info!("{vat} ({}) created", options.name);
                self.lifecycle.push(LifecycleEvent::VatCreated {
                    vat: *vat,
                    name: options.name.clone(),
                });
                Ok(true)
            }
            RunQueueEvent::UpgradeVat { vat, upgrade_id, .. } if self.keeper.is_vat_alive(*vat)? => {
                let incarnation = self.keeper.incarnation(*vat)?;
                log::info!("{vat} upgraded to incarnation {incarnation}");
                self.lifecycle.push(LifecycleEvent::VatUpgraded {
                    vat: *vat,
                    upgrade_id: *upgrade_id,
                    incarnation,
                });
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
