//! Step coordination and optimizer lifecycle
//!
//! [`Optimizer`] owns the per-parameter state store and drives one logical
//! optimization step at a time: for every parameter with a gradient, in
//! group-then-index order, it resolves configuration (group defaults merged
//! with cached overrides), lazily initializes state, schedules prefetch of
//! managed buffers, and dispatches to the external update kernel.
//!
//! On the very first `step()` of an instance, guarded by a flag so the path
//! runs exactly once, registered overrides are resolved against the live
//! parameter list and any pre-existing state (e.g. restored from a
//! checkpoint under mixed precision) is migrated to its parameter's device.
//!
//! `step()` is synchronous and runs to completion or fails; the only
//! concurrency is the device-level overlap of issued prefetches (see the
//! streaming module's ordering contract).

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::checkpoint::{self, Checkpoint, SavedGroup};
use crate::codebook::{CodebookPair, QuantMaps};
use crate::config::{ConfigOverride, EngineArgs, GroupDefaults, ResolvedConfig};
use crate::error::{AfinarError, Result};
use crate::kernel::{OptimizerFamily, UpdateKernel};
use crate::param::{ParamGroup, ParamId, Parameter, SharedParam};
use crate::registry::OverrideRegistry;
use crate::state::ParamState;
use crate::streaming::{StreamConfig, StreamingManager};
use crate::tensor::Tensor;

/// Optimizer-state manager for one model
///
/// Construct through [`Optimizer::builder`]. The numeric update rule is the
/// caller-supplied [`UpdateKernel`]; this type only manages state.
pub struct Optimizer {
    family: OptimizerFamily,
    groups: Vec<ParamGroup>,
    args: EngineArgs,
    kernel: Box<dyn UpdateKernel>,
    registry: Arc<OverrideRegistry>,
    qmaps: Option<CodebookPair>,
    streaming: Option<StreamingManager>,
    state: HashMap<ParamId, ParamState>,
    passthrough: BTreeMap<u64, ParamState>,
    index_overrides: HashMap<(usize, usize), ConfigOverride>,
    initialized: bool,
}

/// Builder for [`Optimizer`]
pub struct OptimizerBuilder {
    family: OptimizerFamily,
    kernel: Box<dyn UpdateKernel>,
    groups: Vec<ParamGroup>,
    args: EngineArgs,
    quant_maps: QuantMaps,
    registry: Option<Arc<OverrideRegistry>>,
    streaming: Option<StreamConfig>,
}

impl Optimizer {
    /// Start building an optimizer for the given family and update kernel
    #[must_use]
    pub fn builder(
        family: OptimizerFamily,
        kernel: impl UpdateKernel + 'static,
    ) -> OptimizerBuilder {
        OptimizerBuilder {
            family,
            kernel: Box::new(kernel),
            groups: Vec::new(),
            args: EngineArgs::default(),
            quant_maps: QuantMaps::default(),
            registry: None,
            streaming: None,
        }
    }

    /// Update-rule family
    #[must_use]
    pub fn family(&self) -> OptimizerFamily {
        self.family
    }

    /// Managed parameter groups
    #[must_use]
    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Engine-wide policy
    #[must_use]
    pub fn args(&self) -> &EngineArgs {
        &self.args
    }

    /// Whether the first-step initialization path has run
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The streaming manager, when streaming is enabled
    #[must_use]
    pub fn streaming(&self) -> Option<&StreamingManager> {
        self.streaming.as_ref()
    }

    /// State record for the parameter at `(gindex, pindex)`, if initialized
    #[must_use]
    pub fn param_state(&self, gindex: usize, pindex: usize) -> Option<&ParamState> {
        let param = self.groups.get(gindex)?.params.get(pindex)?;
        self.state.get(&ParamId::of(param))
    }

    /// Resolved configuration for the parameter at `(gindex, pindex)`
    ///
    /// Reflects cached overrides, which exist only after the first `step()`;
    /// before that this returns the group defaults merged with engine args.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::ParamNotFound`] for an out-of-range position.
    pub fn config_for(&self, gindex: usize, pindex: usize) -> Result<ResolvedConfig> {
        let group = self.groups.get(gindex).ok_or(AfinarError::ParamNotFound {
            group: gindex,
            index: pindex,
        })?;
        if pindex >= group.params.len() {
            return Err(AfinarError::ParamNotFound {
                group: gindex,
                index: pindex,
            });
        }
        Ok(self.resolved_config(gindex, pindex))
    }

    /// Eagerly initialize state for the parameter at `(gindex, pindex)`
    ///
    /// `step()` does this lazily on the first gradient; calling it here is
    /// only needed when state must exist ahead of time. At most one
    /// initialization per parameter is permitted.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::StateAlreadyInitialized`] on a second call for
    /// the same parameter, [`AfinarError::ParamNotFound`] for an
    /// out-of-range position, and propagates state-allocation failures.
    pub fn init_state(&mut self, gindex: usize, pindex: usize) -> Result<()> {
        let param = self
            .groups
            .get(gindex)
            .and_then(|g| g.params.get(pindex))
            .cloned()
            .ok_or(AfinarError::ParamNotFound {
                group: gindex,
                index: pindex,
            })?;
        let pid = ParamId::of(&param);
        if self.state.contains_key(&pid) {
            return Err(AfinarError::StateAlreadyInitialized {
                group: gindex,
                index: pindex,
            });
        }
        let config = self.resolved_config(gindex, pindex);
        let guard = param
            .read()
            .map_err(|_| AfinarError::LockPoisoned("parameter".to_string()))?;
        let state = ParamState::init(
            &guard.data,
            self.family,
            &config,
            self.qmaps.as_ref(),
            self.streaming.as_ref(),
        )?;
        drop(guard);
        self.state.insert(pid, state);
        Ok(())
    }

    /// Perform one optimization step over every parameter with a gradient
    ///
    /// Parameters are visited strictly in group-then-index order. A
    /// parameter without a gradient is skipped entirely: no state is
    /// created and its step counter does not advance.
    ///
    /// # Errors
    ///
    /// Fails fatally on unresolvable overrides (first step only), state
    /// allocation errors, or a kernel error; a failed step is not resumed.
    pub fn step(&mut self) -> Result<()> {
        if !self.initialized {
            self.index_overrides = self.registry.resolve(&self.groups)?;
            self.migrate_state()?;
            self.initialized = true;
        }

        // Parameters whose slots were managed before this step, in the same
        // traversal order the walk below uses. Prefetch pops this queue.
        let mut managed = self.managed_queue();

        let mut global_idx = 0usize;
        for gindex in 0..self.groups.len() {
            for pindex in 0..self.groups[gindex].params.len() {
                let param = Arc::clone(&self.groups[gindex].params[pindex]);
                let pid = ParamId::of(&param);
                let mut guard = param
                    .write()
                    .map_err(|_| AfinarError::LockPoisoned("parameter".to_string()))?;
                let Parameter { data, grad } = &mut *guard;
                let Some(grad) = grad.as_ref() else {
                    global_idx += 1;
                    continue;
                };

                let config = self.resolved_config(gindex, pindex);
                let state = match self.state.entry(pid) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(ParamState::init(
                        data,
                        self.family,
                        &config,
                        self.qmaps.as_ref(),
                        self.streaming.as_ref(),
                    )?),
                };

                if managed.front() == Some(&global_idx) {
                    managed.pop_front();
                    if let Some(manager) = &self.streaming {
                        // Issued, not awaited: the device stream orders the
                        // copy before the update kernel dispatched below.
                        let mut buffers: Vec<&mut Tensor> = Vec::with_capacity(2);
                        if state.state1.is_managed() {
                            buffers.push(&mut state.state1);
                        }
                        if let Some(slot) = state.state2.as_mut() {
                            if slot.is_managed() {
                                buffers.push(slot);
                            }
                        }
                        manager.prefetch(&mut buffers, data.device())?;
                    }
                }

                state.step += 1;
                self.kernel.apply(self.family, grad, data, state, &config)?;

                global_idx += 1;
            }
        }
        Ok(())
    }

    /// Snapshot the optimizer into a serializable checkpoint
    ///
    /// State entries restored earlier whose identities matched no live
    /// parameter are re-emitted verbatim.
    #[must_use]
    pub fn state_dict(&self) -> Checkpoint {
        let mut param_groups = Vec::with_capacity(self.groups.len());
        let mut state = BTreeMap::new();
        for (key, saved) in &self.passthrough {
            state.insert(*key, saved.clone());
        }
        let mut flat = 0u64;
        for group in &self.groups {
            let mut params = Vec::with_capacity(group.params.len());
            for param in &group.params {
                params.push(flat);
                if let Some(record) = self.state.get(&ParamId::of(param)) {
                    state.insert(flat, record.clone());
                }
                flat += 1;
            }
            param_groups.push(SavedGroup {
                defaults: group.defaults.clone(),
                params,
            });
        }
        Checkpoint {
            param_groups,
            state,
        }
    }

    /// Restore optimizer state from a checkpoint
    ///
    /// Group shapes must match exactly. Matched state is deep-copied through
    /// the pure checkpoint cast (slots and scales move to the owning
    /// parameter's device without dtype conversion; see the checkpoint
    /// module). Saved group defaults replace the live ones. State keyed to
    /// identities absent from the live parameter set is kept for the next
    /// save rather than dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::GroupCountMismatch`] or
    /// [`AfinarError::GroupSizeMismatch`] on shape disagreement; no partial
    /// merge is performed.
    pub fn load_state_dict(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let Checkpoint {
            param_groups: saved_groups,
            state: saved_state,
        } = checkpoint;
        let live_sizes: Vec<usize> = self.groups.iter().map(|g| g.params.len()).collect();
        checkpoint::validate_groups(&saved_groups, &live_sizes)?;

        let mut id_map: HashMap<u64, SharedParam> = HashMap::new();
        for (saved_group, live_group) in saved_groups.iter().zip(&self.groups) {
            for (key, param) in saved_group.params.iter().zip(&live_group.params) {
                id_map.insert(*key, Arc::clone(param));
            }
        }

        let mut state = HashMap::new();
        let mut passthrough = BTreeMap::new();
        for (key, saved) in saved_state {
            match id_map.get(&key) {
                Some(param) => {
                    let guard = param
                        .read()
                        .map_err(|_| AfinarError::LockPoisoned("parameter".to_string()))?;
                    let cast =
                        checkpoint::cast_state(guard.data.device(), guard.data.dtype(), &saved)?;
                    drop(guard);
                    state.insert(ParamId::of(param), cast);
                },
                None => {
                    passthrough.insert(key, saved);
                },
            }
        }

        self.state = state;
        self.passthrough = passthrough;
        for (live, saved) in self.groups.iter_mut().zip(saved_groups) {
            live.defaults = saved.defaults;
        }
        Ok(())
    }

    fn resolved_config(&self, gindex: usize, pindex: usize) -> ResolvedConfig {
        let mut config = ResolvedConfig::from_parts(&self.groups[gindex].defaults, &self.args);
        if let Some(fragment) = self.index_overrides.get(&(gindex, pindex)) {
            config.apply(fragment);
        }
        config
    }

    /// Traversal positions of parameters whose slots are managed buffers
    fn managed_queue(&self) -> VecDeque<usize> {
        let mut queue = VecDeque::new();
        if self.streaming.is_none() {
            return queue;
        }
        let mut global_idx = 0usize;
        for group in &self.groups {
            for param in &group.params {
                if let Some(state) = self.state.get(&ParamId::of(param)) {
                    if state.has_managed_slots() {
                        queue.push_back(global_idx);
                    }
                }
                global_idx += 1;
            }
        }
        queue
    }

    /// Move every existing state buffer to its owning parameter's device
    fn migrate_state(&mut self) -> Result<()> {
        for group in &self.groups {
            for param in &group.params {
                if let Some(state) = self.state.get_mut(&ParamId::of(param)) {
                    let device = param
                        .read()
                        .map_err(|_| AfinarError::LockPoisoned("parameter".to_string()))?
                        .data
                        .device();
                    state.move_to(device);
                }
            }
        }
        Ok(())
    }
}

impl OptimizerBuilder {
    /// Append a parameter group
    #[must_use]
    pub fn add_group(mut self, params: Vec<SharedParam>, defaults: GroupDefaults) -> Self {
        self.groups.push(ParamGroup::new(params, defaults));
        self
    }

    /// Set engine-wide policy
    #[must_use]
    pub fn args(mut self, args: EngineArgs) -> Self {
        self.args = args;
        self
    }

    /// Set the codebook source for 8-bit state
    #[must_use]
    pub fn quant_maps(mut self, maps: QuantMaps) -> Self {
        self.quant_maps = maps;
        self
    }

    /// Attach a shared override registry
    ///
    /// Without one, the optimizer uses a private empty registry and no
    /// overrides apply.
    #[must_use]
    pub fn registry(mut self, registry: Arc<OverrideRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Enable host/device streaming of oversized state buffers
    #[must_use]
    pub fn streaming(mut self, config: StreamConfig) -> Self {
        self.streaming = Some(config);
        self
    }

    /// Validate hyperparameters and construct the optimizer
    ///
    /// Codebooks are built here, once, when the bit-width policy is 8.
    ///
    /// # Errors
    ///
    /// Returns [`AfinarError::InvalidHyperparameter`] for out-of-range group
    /// defaults and [`AfinarError::UnsupportedQuantizationScheme`] for an
    /// unrecognized named codebook scheme.
    pub fn build(self) -> Result<Optimizer> {
        for group in &self.groups {
            group.defaults.validate()?;
        }
        let qmaps = if self.args.optim_bits == 8 {
            Some(self.quant_maps.build()?)
        } else {
            None
        };
        Ok(Optimizer {
            family: self.family,
            groups: self.groups,
            args: self.args,
            kernel: self.kernel,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(OverrideRegistry::new())),
            qmaps,
            streaming: self.streaming.map(StreamingManager::new),
            state: HashMap::new(),
            passthrough: BTreeMap::new(),
            index_overrides: HashMap::new(),
            initialized: false,
        })
    }
}
