//! Chain lifecycle
//!
//! Open and close are serialized by the scheduler's lifecycle lock. A stage
//! shared by several instances is opened once and initialized per instance.

use super::Scheduler;
use crate::chain::StageChain;
use crate::error::{Result, SchedError};
use crate::frame_queue::FrameQueue;
use crate::stage::{HardwareStage, ParamRegion};
use crate::types::{ChainConfig, ChainId, DoneReason, FrameState, Instance, StageId, StageSet};
use std::sync::Arc;
use std::time::Duration;

impl Scheduler {
    /// Resolve route `chain_id` for `instance`, opening every stage on it
    pub fn open_chain(&self, instance: Instance, chain_id: ChainId, config: ChainConfig) -> Result<Arc<StageChain>> {
        let _guard = self.lifecycle.lock();
        if self.chains.read().contains_key(&instance) {
            return Err(SchedError::Busy(instance));
        }
        let route = self.table.get(chain_id)?.clone();

        let mut opened: Vec<Arc<HardwareStage>> = Vec::with_capacity(route.stages.len());
        for (module_id, id) in route.stages.iter().enumerate() {
            match self.open_stage(instance, *id, module_id as u32, true) {
                Ok(stage) => opened.push(stage),
                Err(e) => {
                    log::error!("[{}][{}] open {} failed: {}", instance, route.name, id, e);
                    for stage in opened.iter().rev() {
                        if let Err(c) = self.close_stage(instance, stage) {
                            log::warn!("[{}][{}] rollback close failed: {}", instance, stage.name(), c);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let queue = Arc::new(FrameQueue::new(self.config.queue_depth));
        let chain = Arc::new(StageChain::new(
            route.id,
            instance,
            opened,
            route.leader_output,
            config,
            queue,
        )?);
        self.chains.write().insert(instance, Arc::clone(&chain));

        log::info!(
            "[{}][{}] chain {} opened: {} stages, {:?}, timeout {:?}",
            instance,
            chain.id(),
            route.name,
            chain.len(),
            config.trigger,
            config.shot_timeout()
        );
        Ok(chain)
    }

    /// Open and initialize stage `id` for `instance`; a `logical` stage is
    /// part of the route the instance was opened with
    fn open_stage(&self, instance: Instance, id: StageId, module_id: u32, logical: bool) -> Result<Arc<HardwareStage>> {
        let stage = Arc::clone(self.registry.stage(id)?);
        let first = stage.open(instance)?;
        if first {
            stage.watchdog().cancel();
            log::info!("[{}][{}] opened", instance, stage.name());
        }

        if let Err(e) = stage.init(instance, !first, module_id) {
            stage.release_open();
            return Err(e);
        }
        if logical {
            self.registry.set_mapped(instance, id);
        } else {
            self.registry.set_physical(instance, id);
        }
        Ok(stage)
    }

    fn close_stage(&self, instance: Instance, stage: &HardwareStage) -> Result<()> {
        let map = self.registry.map(instance);
        if !map.logical.contains(stage.id()) && !map.physical.contains(stage.id()) {
            return Err(SchedError::NotMapped { stage: stage.id(), instance });
        }

        let last = stage.close(instance);
        self.registry.clear_mapped(instance, stage.id());
        if last? {
            stage.watchdog().cancel();
            log::info!("[{}][{}] closed", instance, stage.name());
        }
        Ok(())
    }

    /// Drain and tear down the instance's chain
    pub fn close_chain(&self, instance: Instance) -> Result<()> {
        let _guard = self.lifecycle.lock();
        let chain = self.chain(instance)?;

        chain.leader().watchdog().cancel();
        self.drain(&chain);
        self.chains.write().remove(&instance);

        // stages swapped off the route stay opened until the chain closes
        let logical = self.registry.map(instance).logical;
        let parked: Vec<Arc<HardwareStage>> = self
            .registry
            .stages()
            .filter(|s| logical.contains(s.id()) && !chain.contains(s.id()))
            .cloned()
            .collect();

        let mut first = None;
        for stage in chain.tail_to_head().chain(parked.iter()) {
            if let Err(e) = self.close_stage(instance, stage) {
                log::error!("[{}][{}] close failed: {}", instance, stage.name(), e);
                first.get_or_insert(e);
            }
        }
        log::info!("[{}][{}] chain closed", instance, chain.id());
        first.map_or(Ok(()), Err)
    }

    /// Enable every stage of the chain
    pub fn process_start(&self, instance: Instance) -> Result<()> {
        let chain = self.chain(instance)?;
        for stage in chain.head_to_tail() {
            stage.enable(instance)?;
        }
        self.registry.reset_log_count();
        log::info!("[{}][{}] process started", instance, chain.id());
        Ok(())
    }

    /// Disable every stage of the chain, returning the records a forced
    /// drain had to retire
    ///
    /// Without `forced` the dispatched record gets a bounded wait to reach
    /// WAIT-COMPLETION first.
    pub async fn process_stop(&self, instance: Instance, forced: bool) -> Result<usize> {
        let chain = self.chain(instance)?;
        let queue = chain.queue();
        let mut clean = true;

        if !forced {
            let interval = Duration::from_millis(self.config.stop_wait_interval_ms);
            let mut retries = self.config.stop_wait_retries;
            while !queue.with(|b| b.is_empty(FrameState::Configured)) {
                if retries == 0 {
                    log::warn!("[{}] dispatched frame never started: {}", instance, queue.summary());
                    clean = false;
                    break;
                }
                retries -= 1;
                tokio::time::sleep(interval).await;
            }
        }

        for stage in chain.head_to_tail() {
            match stage.disable(instance, self.config.stage_stop_timeout()) {
                Ok(idle) => clean &= idle,
                Err(e) => {
                    log::error!("[{}][{}] disable failed: {}", instance, stage.name(), e);
                    clean = false;
                }
            }
        }
        if chain.is_trigger_driven() {
            chain.leader().watchdog().cancel();
        }

        let retired = if forced || !clean || queue.in_flight() > 0 {
            self.drain(&chain)
        } else {
            0
        };
        log::info!(
            "[{}][{}] process stopped (forced {}, clean {}, retired {})",
            instance,
            chain.id(),
            forced,
            clean,
            retired
        );
        Ok(retired)
    }

    /// Sensor stream on: start every stage tail-to-head and mark the
    /// sensor position streaming
    pub fn sensor_start(&self, instance: Instance) -> Result<()> {
        let chain = self.chain(instance)?;
        for stage in chain.tail_to_head() {
            stage.sensor_start(instance)?;
        }
        self.registry.set_streaming(instance, true);
        self.registry.reset_bug_count();
        self.registry.reset_log_count();
        self.registry.set_overflow_recovery(false);
        log::info!("[{}][{}] sensor started", instance, chain.id());
        Ok(())
    }

    /// Sensor stream off; a record still waiting after the bounded wait is
    /// retired as unprocessed
    pub async fn sensor_stop(&self, instance: Instance) -> Result<()> {
        let chain = self.chain(instance)?;
        let result = chain.leader().sensor_stop(instance);
        if let Err(e) = &result {
            log::error!("[{}][{}] sensor stop failed: {}", instance, chain.leader().name(), e);
        }
        self.registry.set_streaming(instance, false);

        let queue = chain.queue();
        let interval = Duration::from_millis(self.config.sensor_stop_interval_ms);
        let mut retries = self.config.sensor_stop_retries;
        while queue.len(FrameState::WaitCompletion) > 0 && retries > 0 {
            retries -= 1;
            tokio::time::sleep(interval).await;
        }

        if let Some(head) = queue.peek(FrameState::WaitCompletion) {
            log::warn!("[{}][F:{}] still waiting at sensor stop: {}", instance, head.fcount, queue.summary());
            self.frame_ndone_on(&chain, head.handle, DoneReason::Unprocessed)?;
        }
        log::info!("[{}][{}] sensor stopped", instance, chain.id());
        result
    }

    /// Swap stage `from` for `to` in the instance's route
    ///
    /// Only allowed while nothing is dispatched.
    pub fn change_chain(&self, instance: Instance, from: StageId, to: StageId) -> Result<()> {
        let _guard = self.lifecycle.lock();
        let chain = self.chain(instance)?;
        let queue = chain.queue();
        if queue.len(FrameState::Configured) + queue.len(FrameState::WaitCompletion) > 0 {
            return Err(SchedError::Busy(instance));
        }
        let old = chain
            .stage(from)
            .cloned()
            .ok_or(SchedError::NotMapped { stage: from, instance })?;
        if chain.contains(to) {
            return Err(SchedError::InvalidStage(to));
        }

        let map = self.registry.map(instance);
        // a stage of the opened route is still initialized for the instance
        let reopened = map.logical.contains(to);
        let next = if reopened {
            Arc::clone(self.registry.stage(to)?)
        } else {
            let module_id = chain.head_to_tail().position(|s| s.id() == from).unwrap_or(0) as u32;
            self.open_stage(instance, to, module_id, false)?
        };
        if let Err(e) = old.change_chain(instance, to) {
            if !reopened {
                if let Err(c) = self.close_stage(instance, &next) {
                    log::warn!("[{}][{}] rollback close failed: {}", instance, next.name(), c);
                }
            }
            return Err(e);
        }

        let swapped = Arc::new(chain.replaced(from, Arc::clone(&next))?);
        if chain.leader().id() == from {
            old.watchdog().cancel();
        }
        self.chains.write().insert(instance, swapped);
        self.registry.set_physical(instance, to);
        if map.logical.contains(from) {
            self.registry.clear_physical(instance, from);
        } else {
            self.close_stage(instance, &old)?;
        }

        log::info!("[{}][{}] chain changed {} -> {}", instance, chain.id(), old.name(), next.name());
        Ok(())
    }

    /// Run `op` on every stage of the chain that is physically active
    fn fan_out<F>(&self, instance: Instance, mut op: F) -> Result<()>
    where
        F: FnMut(&HardwareStage, StageSet) -> Result<()>,
    {
        let chain = self.chain(instance)?;
        let active = self.registry.map(instance).physical;
        for stage in chain.head_to_tail().filter(|s| active.contains(s.id())) {
            op(stage, active)?;
        }
        Ok(())
    }

    pub fn set_param(&self, instance: Instance, region: &ParamRegion, lindex: u64, hindex: u64) -> Result<()> {
        self.fan_out(instance, |stage, active| {
            stage.set_param(region, lindex, hindex, instance, active)
        })
    }

    pub fn load_setfile(&self, instance: Instance, scenario: u32) -> Result<()> {
        self.fan_out(instance, |stage, active| stage.load_setfile(instance, scenario, active))
    }

    pub fn apply_setfile(&self, instance: Instance, scenario: u32) -> Result<()> {
        self.fan_out(instance, |stage, active| stage.apply_setfile(instance, scenario, active))?;
        log::info!("[{}] setfile scenario {} applied", instance, scenario);
        Ok(())
    }

    pub fn delete_setfile(&self, instance: Instance, scenario: u32) -> Result<()> {
        self.fan_out(instance, |stage, active| stage.delete_setfile(instance, scenario, active))
    }
}
