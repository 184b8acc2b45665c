use super::*;

impl Kernel {
    pub(crate) fn add_transcript_item(&mut self, vat: VatId, item: &TranscriptItem) -> Result<Option<u64>, KernelError> {
        if !self.keeper.vat_options(vat)?.use_transcript {
            return Ok(None);
        }
        let raw = item.encode()?;
        Ok(Some(self.keeper.store_mut().add_item(&vat.to_string(), &raw)?))
    }

    /// Deliver to a vat, bringing it online first, and fold the outcome
    /// into `results`.
    pub(crate) fn deliver_to_vat(
        &mut self,
        vat: VatId,
        delivery: VatDelivery,
        results: &mut CrankResults,
    ) -> Result<(), KernelError> {
        let options = self.keeper.vat_options(vat)?;
        let limit = options
            .crank_computron_limit
            .or(self.config.default_crank_computron_limit);
        results.vat = Some(vat);

        let Kernel {
            keeper,
            config,
            registry,
            devices,
            warehouse,
            ..
        } = self;
        let worker = match warehouse.worker(keeper, registry, config, vat) {
            Ok(worker) => worker,
            Err(KernelError::Worker(message)) | Err(KernelError::UnknownBundle(message)) => {
                results.delivery_error = Some(message);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        log::debug!("{vat} <- {}", delivery.kind());
        let mut handler = SyscallHandler::new(vat, keeper, devices, Meter::for_delivery(&delivery));
        let status = worker.deliver(&delivery, &mut handler)?;
        let outcome = handler.finish()?;

        let computrons = outcome.meter.used();
        results.delivered = true;
        results.computrons += computrons;
        if let Some(message) = outcome.illegal {
            results.illegal.get_or_insert(message);
        }
        if let DeliveryStatus::Error { message } = &status {
            results.delivery_error.get_or_insert_with(|| message.clone());
        }
        if outcome.meter.exceeds(limit) {
            results.over_budget = true;
        }
        if let Some(exit) = outcome.exit {
            results.exit.get_or_insert(exit);
        }
        let item = TranscriptItem::delivery(delivery, outcome.records, status, computrons);
        self.add_transcript_item(vat, &item)?;
        Ok(())
    }

    /// Reap and snapshot bookkeeping after a successful delivery.
    pub(crate) fn after_delivery(&mut self, vat: VatId, event: &RunQueueEvent) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat)? {
            return Ok(());
        }
        if !matches!(event, RunQueueEvent::BringOutYourDead { .. } | RunQueueEvent::UpgradeVat { .. }) {
            let dirt = self.keeper.reap_dirt(vat)? + 1;
            match self.keeper.reap_interval(vat)?.deliveries() {
                Some(interval) if dirt >= interval => {
                    log::debug!("{vat} reached reap interval {interval}");
                    self.keeper.schedule_reap(vat)?;
                    self.keeper.set_reap_dirt(vat, 0);
                }
                _ => self.keeper.set_reap_dirt(vat, dirt),
            }
        }
        if self.snapshot_due(vat)? {
            self.save_snapshot(vat)?;
        }
        Ok(())
    }

    fn snapshot_due(&self, vat: VatId) -> Result<bool, KernelError> {
        if !self.keeper.vat_options(vat)?.use_transcript {
            return Ok(false);
        }
        let key = vat.to_string();
        let store = self.keeper.store();
        let Some(span) = store.current_span(&key)? else {
            return Ok(false);
        };
        // every span opens with a pseudo-delivery
        let deliveries = span.len().saturating_sub(1);
        let options = self.keeper.kernel_options()?;
        Ok(match store.latest_snapshot(&key)? {
            Some(_) => deliveries >= options.snapshot_interval,
            None => deliveries >= options.snapshot_initial,
        })
    }

    /// Reap, capture the worker's state, and start a new span that begins
    /// from the snapshot. The work runs under its own savepoint: when the
    /// reap or the capture fails, the snapshot is skipped and the delivery
    /// that made it due stands.
    pub(crate) fn save_snapshot(&mut self, vat: VatId) -> Result<(), KernelError> {
        self.keeper.store_mut().establish_savepoint("snapshot")?;
        let maybe_free = self.keeper.maybe_free.clone();
        let mut results = CrankResults::default();
        self.deliver_to_vat(vat, VatDelivery::BringOutYourDead, &mut results)?;
        let failure = results
            .abort_reason()
            .or_else(|| results.exit.as_ref().map(|_| "vat exited during its reap".to_string()));
        if let Some(reason) = failure {
            return self.skip_snapshot(vat, &reason, maybe_free);
        }
        self.keeper.set_reap_dirt(vat, 0);
        let worker = self
            .warehouse
            .online_worker(vat)
            .ok_or_else(|| KernelError::panic(format!("{vat} went offline before its snapshot")))?;
        let bytes = match worker.snapshot() {
            Ok(bytes) => bytes,
            Err(KernelError::Worker(message)) => return self.skip_snapshot(vat, &message, maybe_free),
            Err(err) => return Err(err),
        };
        let key = vat.to_string();
        let span = self
            .keeper
            .store()
            .current_span(&key)?
            .ok_or_else(|| KernelError::corrupt(format!("{vat} has no current span")))?;
        let snap_pos = span.end_pos;
        self.add_transcript_item(vat, &TranscriptItem::pseudo(PseudoDelivery::SaveSnapshot { snap_pos }))?;
        let record = self.keeper.store_mut().save_snapshot(&key, snap_pos, bytes)?;
        self.keeper.store_mut().rollover_span(&key)?;
        self.add_transcript_item(
            vat,
            &TranscriptItem::pseudo(PseudoDelivery::LoadSnapshot {
                snap_pos,
                hash: record.hash.clone(),
            }),
        )?;
        log::info!(
            "{vat} snapshot at {snap_pos}: {} bytes, {}",
            record.uncompressed_size,
            record.hash
        );
        if self.config.restart_worker_on_snapshot {
            self.warehouse.evict(vat);
        }
        Ok(())
    }

    fn skip_snapshot(
        &mut self,
        vat: VatId,
        reason: &str,
        maybe_free: BTreeSet<KernelSlot>,
    ) -> Result<(), KernelError> {
        log::warn!("{vat} snapshot skipped: {reason}");
        self.keeper.store_mut().rollback_to("snapshot")?;
        self.keeper.maybe_free = maybe_free;
        self.warehouse.evict(vat);
        Ok(())
    }
}
