//! Reserve-gated circuit breaker
//!
//! A circuit is a named automaton over [`CircuitState`] driven by three trigger paths:
//!
//! - **Automatic** - a reported metric evaluated against the circuit's thresholds
//! - **Consensus** - validator votes reaching `required_consensus`
//! - **Manual** - an administrator override
//!
//! Precedence is `Manual > Consensus > Automatic`: a lower-precedence trigger may escalate
//! a state set by a higher-precedence one, never de-escalate it. Leaving `Emergency` and
//! entering `Recovering` are manual-only. Every path respects the cooldown.
//!
//! Each circuit sits behind its own mutex; vote, quorum check, transition and vote
//! clearing happen under that lock.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rail_core::{
    AccessControl, EventBus, FunctionId, MetricOracle, Metrics, Principal, Role,
    SettlementEvent, SharedClock, TransitionTrigger,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest accepted cooldown (ten years)
pub const MAX_COOLDOWN_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Active,
    /// Metric above the warning threshold; nothing blocked
    Warning,
    /// Marked functions blocked
    Restricted,
    /// Everything blocked
    Emergency,
    /// Manual probation after an incident; nothing blocked
    Recovering,
}

impl CircuitState {
    /// Ordering used for escalation checks
    pub fn severity(&self) -> u8 {
        match self {
            CircuitState::Active => 0,
            CircuitState::Warning | CircuitState::Recovering => 1,
            CircuitState::Restricted => 2,
            CircuitState::Emergency => 3,
        }
    }

    /// Stable name for events
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Active => "Active",
            CircuitState::Warning => "Warning",
            CircuitState::Restricted => "Restricted",
            CircuitState::Emergency => "Emergency",
            CircuitState::Recovering => "Recovering",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(String);

impl CircuitId {
    /// Create new circuit ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Circuit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitDefinition {
    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Metric value entering `Warning`
    pub warning_threshold: Decimal,

    /// Metric value entering `Restricted`
    pub restricted_threshold: Decimal,

    /// Metric value entering `Emergency`
    pub emergency_threshold: Decimal,

    /// Minimum seconds between two transitions
    #[serde(default)]
    pub cooldown_secs: u64,

    /// Principals allowed to vote
    #[serde(default)]
    pub validators: BTreeSet<Principal>,

    /// Votes needed for a consensus transition
    #[serde(default)]
    pub required_consensus: usize,

    /// Whether reported metrics drive transitions
    #[serde(default)]
    pub automated: bool,

    /// Oracle metric followed by [`CircuitBreaker::refresh_from_oracle`]
    #[serde(default)]
    pub metric_id: Option<String>,

    /// Functions blocked while `Restricted`
    #[serde(default)]
    pub restricted_functions: BTreeSet<FunctionId>,
}

impl CircuitDefinition {
    /// Manual-only circuit with the given thresholds and no cooldown
    pub fn new(
        name: impl Into<String>,
        warning_threshold: Decimal,
        restricted_threshold: Decimal,
        emergency_threshold: Decimal,
    ) -> Self {
        Self {
            name: name.into(),
            warning_threshold,
            restricted_threshold,
            emergency_threshold,
            cooldown_secs: 0,
            validators: BTreeSet::new(),
            required_consensus: 0,
            automated: false,
            metric_id: None,
            restricted_functions: BTreeSet::new(),
        }
    }

    /// Set the cooldown
    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    /// Set the validator set and quorum
    pub fn with_validators<I, P>(mut self, validators: I, required_consensus: usize) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.validators = validators
            .into_iter()
            .map(Principal::new)
            .collect();
        self.required_consensus = required_consensus;
        self
    }

    /// Enable automatic evaluation, optionally following an oracle metric
    pub fn automated(mut self, metric_id: Option<&str>) -> Self {
        self.automated = true;
        self.metric_id = metric_id.map(str::to_string);
        self
    }

    /// Mark a function as blocked while `Restricted`
    pub fn restrict(mut self, function: &str) -> Self {
        self.restricted_functions.insert(FunctionId::new(function));
        self
    }

    /// Check threshold ordering and quorum bounds
    pub fn validate(&self) -> Result<()> {
        if !(self.warning_threshold < self.restricted_threshold
            && self.restricted_threshold < self.emergency_threshold)
        {
            return Err(Error::InvalidConfig(format!(
                "thresholds must increase: {} < {} < {}",
                self.warning_threshold, self.restricted_threshold, self.emergency_threshold
            )));
        }

        if self.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(Error::InvalidConfig(format!(
                "cooldown_secs must be at most {}, got {}",
                MAX_COOLDOWN_SECS, self.cooldown_secs
            )));
        }

        if self.validators.is_empty() {
            if self.required_consensus != 0 {
                return Err(Error::InvalidConfig(
                    "required_consensus set without validators".to_string(),
                ));
            }
        } else if self.required_consensus == 0 || self.required_consensus > self.validators.len()
        {
            return Err(Error::InvalidConfig(format!(
                "required_consensus must be in 1..={}, got {}",
                self.validators.len(),
                self.required_consensus
            )));
        }

        if self.metric_id.is_some() && !self.automated {
            return Err(Error::InvalidConfig(
                "metric_id requires an automated circuit".to_string(),
            ));
        }

        Ok(())
    }

    /// State implied by a metric value, evaluated from the highest severity down
    pub fn target_for(&self, value: Decimal) -> CircuitState {
        if value >= self.emergency_threshold {
            CircuitState::Emergency
        } else if value >= self.restricted_threshold {
            CircuitState::Restricted
        } else if value >= self.warning_threshold {
            CircuitState::Warning
        } else {
            CircuitState::Active
        }
    }
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    /// Previous state
    pub from: CircuitState,
    /// New state
    pub to: CircuitState,
    /// Trigger path
    pub trigger: TransitionTrigger,
    /// Operator reason (manual transitions)
    pub reason: Option<String>,
    /// Time applied
    pub at: DateTime<Utc>,
}

/// Result of a vote
#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// Vote stored; quorum not reached yet
    Recorded {
        /// Votes currently cast for the target
        votes: usize,
        /// Votes needed
        required: usize,
    },
    /// Quorum reached and the transition applied
    Transitioned(CircuitTransition),
}

/// Circuit snapshot
#[derive(Debug, Clone, Serialize)]
pub struct Circuit {
    /// Circuit ID
    pub id: CircuitId,
    /// Configuration
    pub definition: CircuitDefinition,
    /// Current state
    pub state: CircuitState,
    /// Time of the last transition; `None` before the first
    pub last_state_change: Option<DateTime<Utc>>,
    /// Trigger of the last transition
    pub last_trigger: Option<TransitionTrigger>,
    /// Pending votes (one per validator)
    pub votes: BTreeMap<Principal, CircuitState>,
    /// Last reported metric and its observation time
    pub last_metric: Option<(Decimal, DateTime<Utc>)>,
    /// Applied transitions, oldest first
    pub history: Vec<CircuitTransition>,
}

impl Circuit {
    fn new(id: CircuitId, definition: CircuitDefinition) -> Self {
        Self {
            id,
            definition,
            state: CircuitState::Active,
            last_state_change: None,
            last_trigger: None,
            votes: BTreeMap::new(),
            last_metric: None,
            history: Vec::new(),
        }
    }

    /// Whether `function` is blocked in the current state
    pub fn is_function_restricted(&self, function: &FunctionId) -> bool {
        match self.state {
            CircuitState::Emergency => true,
            CircuitState::Restricted => self.definition.restricted_functions.contains(function),
            _ => false,
        }
    }

    /// Votes currently cast for `target`
    pub fn votes_for(&self, target: CircuitState) -> usize {
        self.votes.values().filter(|v| **v == target).count()
    }

    fn not_allowed(&self, to: CircuitState, trigger: TransitionTrigger, reason: &str) -> Error {
        Error::TransitionNotAllowed {
            circuit: self.id.to_string(),
            from: self.state,
            to,
            trigger,
            reason: reason.to_string(),
        }
    }

    /// Trigger-path rules, independent of time
    fn check_precedence(&self, to: CircuitState, trigger: TransitionTrigger) -> Result<()> {
        if to == self.state {
            return Err(self.not_allowed(to, trigger, "circuit already in target state"));
        }
        if trigger == TransitionTrigger::Manual {
            return Ok(());
        }
        if self.state == CircuitState::Emergency {
            return Err(self.not_allowed(to, trigger, "leaving Emergency requires manual action"));
        }
        if to == CircuitState::Recovering {
            return Err(self.not_allowed(to, trigger, "Recovering is entered manually"));
        }
        if let Some(last) = self.last_trigger {
            if last > trigger && to.severity() <= self.state.severity() {
                return Err(self.not_allowed(
                    to,
                    trigger,
                    &format!("state set by {:?} trigger may only be escalated", last),
                ));
            }
        }
        Ok(())
    }

    fn check_cooldown(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(last) = self.last_state_change else {
            return Ok(());
        };
        let ready_at = i64::try_from(self.definition.cooldown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|cooldown| last.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if now < ready_at {
            let remaining_ms = (ready_at - now).num_milliseconds();
            return Err(Error::CooldownActive {
                circuit: self.id.to_string(),
                remaining_secs: (remaining_ms + 999) / 1000,
            });
        }
        Ok(())
    }

    fn check_transition(
        &self,
        to: CircuitState,
        trigger: TransitionTrigger,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_precedence(to, trigger)?;
        self.check_cooldown(now)
    }

    fn apply(
        &mut self,
        to: CircuitState,
        trigger: TransitionTrigger,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> CircuitTransition {
        let transition = CircuitTransition {
            from: self.state,
            to,
            trigger,
            reason,
            at: now,
        };
        self.state = to;
        self.last_state_change = Some(now);
        self.last_trigger = Some(trigger);
        self.votes.clear();
        self.history.push(transition.clone());
        transition
    }
}

/// Registry of circuits and their trigger paths
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: RwLock<BTreeMap<CircuitId, Arc<Mutex<Circuit>>>>,
    access: AccessControl,
    clock: SharedClock,
    events: EventBus,
    metrics: Metrics,
}

impl CircuitBreaker {
    /// Create an empty breaker
    pub fn new(access: AccessControl, clock: SharedClock, events: EventBus, metrics: Metrics) -> Self {
        Self {
            circuits: RwLock::new(BTreeMap::new()),
            access,
            clock,
            events,
            metrics,
        }
    }

    fn handle(&self, id: &CircuitId) -> Result<Arc<Mutex<Circuit>>> {
        self.circuits
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::CircuitNotFound(id.to_string()))
    }

    /// Create a circuit in `Active` (admin only)
    pub fn create_circuit(
        &self,
        caller: &Principal,
        id: CircuitId,
        definition: CircuitDefinition,
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        definition.validate()?;

        let mut circuits = self.circuits.write();
        if circuits.contains_key(&id) {
            return Err(Error::CircuitExists(id.to_string()));
        }

        info!(circuit = %id, name = %definition.name, automated = definition.automated, "Circuit created");
        circuits.insert(id.clone(), Arc::new(Mutex::new(Circuit::new(id, definition))));
        Ok(())
    }

    /// Replace a circuit's configuration (admin only). State and history are kept;
    /// pending votes are dropped.
    pub fn update_circuit(
        &self,
        caller: &Principal,
        id: &CircuitId,
        definition: CircuitDefinition,
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        definition.validate()?;

        let handle = self.handle(id)?;
        let mut circuit = handle.lock();
        circuit.definition = definition;
        circuit.votes.clear();
        info!(circuit = %id, "Circuit definition updated");
        Ok(())
    }

    /// Mark or unmark a function as blocked while `Restricted` (admin only)
    pub fn set_function_restricted(
        &self,
        caller: &Principal,
        id: &CircuitId,
        function: FunctionId,
        restricted: bool,
    ) -> Result<()> {
        self.access.require(caller, Role::Admin)?;
        let handle = self.handle(id)?;
        let mut circuit = handle.lock();
        if restricted {
            circuit.definition.restricted_functions.insert(function.clone());
        } else {
            circuit.definition.restricted_functions.remove(&function);
        }
        info!(circuit = %id, function = %function, restricted, "Function restriction updated");
        Ok(())
    }

    /// Report a metric value (Reporter role) on an automated circuit
    pub fn report_metric(
        &self,
        reporter: &Principal,
        id: &CircuitId,
        value: Decimal,
    ) -> Result<Option<CircuitTransition>> {
        self.access.require(reporter, Role::Reporter)?;
        let now = self.clock.now();
        self.apply_metric(id, value, now)
    }

    /// Evaluate a metric observation. Returns the transition if one applied.
    ///
    /// Precedence conflicts leave the state unchanged and are not errors; cooldown is.
    pub(crate) fn apply_metric(
        &self,
        id: &CircuitId,
        value: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<CircuitTransition>> {
        let handle = self.handle(id)?;
        let mut circuit = handle.lock();
        if !circuit.definition.automated {
            return Err(Error::NotAutomated(id.to_string()));
        }

        circuit.last_metric = Some((value, observed_at));
        let target = circuit.definition.target_for(value);
        if target == circuit.state {
            return Ok(None);
        }

        match circuit.check_precedence(target, TransitionTrigger::Automatic) {
            Ok(()) => {}
            Err(Error::TransitionNotAllowed { reason, .. }) => {
                debug!(circuit = %id, value = %value, target = %target, reason = %reason, "Metric evaluation held");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let now = self.clock.now();
        circuit.check_cooldown(now)?;
        let transition = circuit.apply(target, TransitionTrigger::Automatic, None, now);
        self.announce(&circuit, &transition);
        Ok(Some(transition))
    }

    /// Cast or replace a validator's vote
    pub fn vote(
        &self,
        validator: &Principal,
        id: &CircuitId,
        target: CircuitState,
    ) -> Result<VoteOutcome> {
        let handle = self.handle(id)?;
        let mut circuit = handle.lock();

        if !circuit.definition.validators.contains(validator) {
            return Err(Error::NotValidator {
                circuit: id.to_string(),
                principal: validator.clone(),
            });
        }
        circuit.check_precedence(target, TransitionTrigger::Consensus)?;

        let previous = circuit.votes.insert(validator.clone(), target);
        let votes = circuit.votes_for(target);
        let required = circuit.definition.required_consensus;

        if votes < required {
            info!(circuit = %id, validator = %validator, target = %target, votes, required, "Vote recorded");
            return Ok(VoteOutcome::Recorded { votes, required });
        }

        let now = self.clock.now();
        if let Err(e) = circuit.check_cooldown(now) {
            // Rejected votes leave no trace
            match previous {
                Some(prev) => circuit.votes.insert(validator.clone(), prev),
                None => circuit.votes.remove(validator),
            };
            return Err(e);
        }

        let transition = circuit.apply(target, TransitionTrigger::Consensus, None, now);
        self.announce(&circuit, &transition);
        Ok(VoteOutcome::Transitioned(transition))
    }

    /// Administrator override (admin only)
    pub fn set_state(
        &self,
        admin: &Principal,
        id: &CircuitId,
        target: CircuitState,
        reason: &str,
    ) -> Result<CircuitTransition> {
        self.access.require(admin, Role::Admin)?;
        let handle = self.handle(id)?;
        let mut circuit = handle.lock();

        let now = self.clock.now();
        circuit.check_transition(target, TransitionTrigger::Manual, now)?;
        let transition = circuit.apply(
            target,
            TransitionTrigger::Manual,
            Some(reason.to_string()),
            now,
        );
        self.announce(&circuit, &transition);
        Ok(transition)
    }

    fn announce(&self, circuit: &Circuit, transition: &CircuitTransition) {
        match transition.to {
            CircuitState::Emergency => error!(
                circuit = %circuit.id,
                from = %transition.from,
                trigger = ?transition.trigger,
                "Circuit entered Emergency"
            ),
            CircuitState::Restricted => warn!(
                circuit = %circuit.id,
                from = %transition.from,
                trigger = ?transition.trigger,
                "Circuit restricted"
            ),
            to => info!(
                circuit = %circuit.id,
                from = %transition.from,
                to = %to,
                trigger = ?transition.trigger,
                "Circuit state changed"
            ),
        }

        self.metrics.circuit_transitions.inc();
        self.events.publish(SettlementEvent::CircuitStateChanged {
            circuit_id: circuit.id.to_string(),
            old: transition.from.to_string(),
            new: transition.to.to_string(),
            trigger: transition.trigger,
            at: transition.at,
        });
    }

    /// Current state
    pub fn state(&self, id: &CircuitId) -> Result<CircuitState> {
        Ok(self.handle(id)?.lock().state)
    }

    /// Snapshot of a circuit
    pub fn circuit(&self, id: &CircuitId) -> Result<Circuit> {
        Ok(self.handle(id)?.lock().clone())
    }

    /// All circuit IDs
    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.read().keys().cloned().collect()
    }

    /// Whether `function` is blocked by circuit `id`
    pub fn is_function_restricted(&self, id: &CircuitId, function: &FunctionId) -> Result<bool> {
        Ok(self.handle(id)?.lock().is_function_restricted(function))
    }

    /// Fail if any circuit blocks `function`. `Emergency` wins over `Restricted`.
    pub fn check_function(&self, function: &FunctionId) -> Result<()> {
        let handles: Vec<_> = self.circuits.read().values().cloned().collect();
        let mut restricted_by = None;

        for handle in handles {
            let circuit = handle.lock();
            if circuit.state == CircuitState::Emergency {
                return Err(Error::EmergencyHalt {
                    circuit: circuit.id.to_string(),
                });
            }
            if restricted_by.is_none() && circuit.is_function_restricted(function) {
                restricted_by = Some(circuit.id.to_string());
            }
        }

        match restricted_by {
            Some(circuit) => Err(Error::FunctionRestricted {
                circuit,
                function: function.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Evaluate every automated circuit that follows an oracle metric
    pub fn refresh_from_oracle(
        &self,
        oracle: &dyn MetricOracle,
    ) -> Vec<(CircuitId, Result<Option<CircuitTransition>>)> {
        let followed: Vec<(CircuitId, String)> = self
            .circuits
            .read()
            .values()
            .filter_map(|handle| {
                let circuit = handle.lock();
                match (&circuit.definition.metric_id, circuit.definition.automated) {
                    (Some(metric), true) => Some((circuit.id.clone(), metric.clone())),
                    _ => None,
                }
            })
            .collect();

        followed
            .into_iter()
            .filter_map(|(id, metric)| {
                let (value, as_of) = oracle.current_metric(&metric)?;
                let result = self.apply_metric(&id, value, as_of);
                Some((id, result))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rail_core::collaborators::{InMemoryOracle, InMemoryRoles};
    use rail_core::{Clock, ManualClock};

    struct Fixture {
        breaker: CircuitBreaker,
        clock: Arc<ManualClock>,
        admin: Principal,
        reporter: Principal,
    }

    fn fixture() -> Fixture {
        let roles = InMemoryRoles::new()
            .with_role("admin", Role::Admin)
            .with_role("reporter", Role::Reporter);
        let clock = ManualClock::shared();
        let breaker = CircuitBreaker::new(
            AccessControl::new(Arc::new(roles)),
            clock.clone(),
            EventBus::default(),
            Metrics::new().unwrap(),
        );
        Fixture {
            breaker,
            clock,
            admin: Principal::new("admin"),
            reporter: Principal::new("reporter"),
        }
    }

    fn reserve_ratio() -> CircuitDefinition {
        CircuitDefinition::new(
            "reserve ratio",
            Decimal::from(100),
            Decimal::from(500),
            Decimal::from(900),
        )
        .automated(None)
        .restrict("transfer")
    }

    fn id() -> CircuitId {
        CircuitId::new("reserve")
    }

    #[test]
    fn test_threshold_ordering() {
        let f = fixture();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();

        let transition = f
            .breaker
            .report_metric(&f.reporter, &id(), Decimal::from(950))
            .unwrap()
            .unwrap();
        assert_eq!(transition.to, CircuitState::Emergency);
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Emergency);
    }

    #[test]
    fn test_target_for_boundaries() {
        let def = reserve_ratio();
        assert_eq!(def.target_for(Decimal::from(99)), CircuitState::Active);
        assert_eq!(def.target_for(Decimal::from(100)), CircuitState::Warning);
        assert_eq!(def.target_for(Decimal::from(500)), CircuitState::Restricted);
        assert_eq!(def.target_for(Decimal::from(900)), CircuitState::Emergency);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let f = fixture();
        let def = CircuitDefinition::new("bad", Decimal::from(500), Decimal::from(100), Decimal::from(900));
        assert!(matches!(
            f.breaker.create_circuit(&f.admin, id(), def),
            Err(Error::InvalidConfig(_))
        ));

        let def = reserve_ratio().with_validators(["v1", "v2"], 3);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_oversized_cooldown_rejected() {
        let f = fixture();
        for cooldown in [u64::MAX, i64::MAX as u64, MAX_COOLDOWN_SECS + 1] {
            assert!(matches!(
                f.breaker
                    .create_circuit(&f.admin, id(), reserve_ratio().with_cooldown(cooldown)),
                Err(Error::InvalidConfig(_))
            ));
        }
        f.breaker
            .create_circuit(&f.admin, id(), reserve_ratio().with_cooldown(MAX_COOLDOWN_SECS))
            .unwrap();
    }

    #[test]
    fn test_unrepresentable_cooldown_holds() {
        let mut circuit = Circuit::new(id(), reserve_ratio().with_cooldown(u64::MAX));
        let now = Utc::now();
        circuit.last_state_change = Some(now);
        assert!(matches!(
            circuit.check_cooldown(now + Duration::days(365)),
            Err(Error::CooldownActive { .. })
        ));
    }

    #[test]
    fn test_cooldown_blocks_second_transition() {
        let f = fixture();
        f.breaker
            .create_circuit(&f.admin, id(), reserve_ratio().with_cooldown(3600))
            .unwrap();

        // First transition is never gated
        f.breaker
            .report_metric(&f.reporter, &id(), Decimal::from(600))
            .unwrap();
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Restricted);

        f.clock.advance(Duration::seconds(10));
        assert!(matches!(
            f.breaker.report_metric(&f.reporter, &id(), Decimal::from(950)),
            Err(Error::CooldownActive { remaining_secs: 3590, .. })
        ));
        assert!(matches!(
            f.breaker.set_state(&f.admin, &id(), CircuitState::Active, "all clear"),
            Err(Error::CooldownActive { .. })
        ));
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Restricted);

        f.clock.advance(Duration::seconds(3590));
        f.breaker
            .report_metric(&f.reporter, &id(), Decimal::from(950))
            .unwrap();
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Emergency);
    }

    #[test]
    fn test_report_requires_reporter_role() {
        let f = fixture();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();
        assert!(matches!(
            f.breaker
                .report_metric(&Principal::new("mallory"), &id(), Decimal::from(950)),
            Err(Error::Core(rail_core::Error::AccessDenied { .. }))
        ));
    }

    #[test]
    fn test_report_on_manual_circuit_rejected() {
        let f = fixture();
        let def = CircuitDefinition::new("manual", Decimal::ONE, Decimal::TWO, Decimal::TEN);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();
        assert!(matches!(
            f.breaker.report_metric(&f.reporter, &id(), Decimal::TEN),
            Err(Error::NotAutomated(_))
        ));
    }

    #[test]
    fn test_consensus_three_of_five() {
        let f = fixture();
        let def = reserve_ratio().with_validators(["v1", "v2", "v3", "v4", "v5"], 3);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();

        for (i, v) in ["v1", "v2"].iter().enumerate() {
            let outcome = f
                .breaker
                .vote(&Principal::new(*v), &id(), CircuitState::Restricted)
                .unwrap();
            assert_eq!(
                outcome,
                VoteOutcome::Recorded {
                    votes: i + 1,
                    required: 3
                }
            );
        }
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Active);

        let outcome = f
            .breaker
            .vote(&Principal::new("v3"), &id(), CircuitState::Restricted)
            .unwrap();
        assert!(matches!(outcome, VoteOutcome::Transitioned(_)));

        let circuit = f.breaker.circuit(&id()).unwrap();
        assert_eq!(circuit.state, CircuitState::Restricted);
        assert!(circuit.votes.is_empty());
        assert_eq!(circuit.last_trigger, Some(TransitionTrigger::Consensus));
    }

    #[test]
    fn test_revote_replaces_previous_vote() {
        let f = fixture();
        let def = reserve_ratio().with_validators(["v1", "v2", "v3"], 2);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();

        let v1 = Principal::new("v1");
        f.breaker.vote(&v1, &id(), CircuitState::Warning).unwrap();
        f.breaker.vote(&v1, &id(), CircuitState::Restricted).unwrap();

        let circuit = f.breaker.circuit(&id()).unwrap();
        assert_eq!(circuit.votes.len(), 1);
        assert_eq!(circuit.votes_for(CircuitState::Warning), 0);
        assert_eq!(circuit.votes_for(CircuitState::Restricted), 1);
    }

    #[test]
    fn test_non_validator_vote_rejected() {
        let f = fixture();
        let def = reserve_ratio().with_validators(["v1"], 1);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();
        assert!(matches!(
            f.breaker
                .vote(&Principal::new("v9"), &id(), CircuitState::Warning),
            Err(Error::NotValidator { .. })
        ));
    }

    #[test]
    fn test_quorum_vote_under_cooldown_not_recorded() {
        let f = fixture();
        let def = reserve_ratio()
            .with_cooldown(60)
            .with_validators(["v1", "v2"], 2);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();
        f.breaker
            .set_state(&f.admin, &id(), CircuitState::Warning, "drill")
            .unwrap();

        f.breaker
            .vote(&Principal::new("v1"), &id(), CircuitState::Restricted)
            .unwrap();
        assert!(matches!(
            f.breaker
                .vote(&Principal::new("v2"), &id(), CircuitState::Restricted),
            Err(Error::CooldownActive { .. })
        ));
        assert_eq!(f.breaker.circuit(&id()).unwrap().votes.len(), 1);
    }

    #[test]
    fn test_function_restriction() {
        let f = fixture();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();
        let transfer = FunctionId::new("transfer");
        let mint = FunctionId::new("mint");

        f.breaker
            .set_state(&f.admin, &id(), CircuitState::Restricted, "reserve shortfall")
            .unwrap();
        assert!(f.breaker.is_function_restricted(&id(), &transfer).unwrap());
        assert!(!f.breaker.is_function_restricted(&id(), &mint).unwrap());
        assert!(matches!(
            f.breaker.check_function(&transfer),
            Err(Error::FunctionRestricted { .. })
        ));
        f.breaker.check_function(&mint).unwrap();

        f.breaker
            .set_function_restricted(&f.admin, &id(), transfer.clone(), false)
            .unwrap();
        f.breaker.check_function(&transfer).unwrap();

        f.breaker
            .set_state(&f.admin, &id(), CircuitState::Emergency, "halt")
            .unwrap();
        assert!(matches!(
            f.breaker.check_function(&mint),
            Err(Error::EmergencyHalt { .. })
        ));
    }

    #[test]
    fn test_emergency_cleared_only_manually() {
        let f = fixture();
        let def = reserve_ratio().with_validators(["v1"], 1);
        f.breaker.create_circuit(&f.admin, id(), def).unwrap();
        f.breaker
            .report_metric(&f.reporter, &id(), Decimal::from(950))
            .unwrap();

        assert_eq!(
            f.breaker
                .report_metric(&f.reporter, &id(), Decimal::ZERO)
                .unwrap(),
            None
        );
        assert!(matches!(
            f.breaker
                .vote(&Principal::new("v1"), &id(), CircuitState::Active),
            Err(Error::TransitionNotAllowed { .. })
        ));
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Emergency);

        f.breaker
            .set_state(&f.admin, &id(), CircuitState::Recovering, "reserves restored")
            .unwrap();
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Recovering);
    }

    #[test]
    fn test_manual_state_only_escalated_automatically() {
        let f = fixture();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();
        f.breaker
            .set_state(&f.admin, &id(), CircuitState::Restricted, "audit")
            .unwrap();

        assert_eq!(
            f.breaker
                .report_metric(&f.reporter, &id(), Decimal::ZERO)
                .unwrap(),
            None
        );
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Restricted);

        f.breaker
            .report_metric(&f.reporter, &id(), Decimal::from(950))
            .unwrap();
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Emergency);
    }

    #[test]
    fn test_set_state_requires_admin() {
        let f = fixture();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();
        assert!(f
            .breaker
            .set_state(&f.reporter, &id(), CircuitState::Emergency, "x")
            .is_err());
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Active);
    }

    #[test]
    fn test_refresh_from_oracle() {
        let f = fixture();
        f.breaker
            .create_circuit(&f.admin, id(), reserve_ratio().automated(Some("reserve/deficit")))
            .unwrap();

        let oracle = InMemoryOracle::new();
        oracle.publish("reserve/deficit", Decimal::from(550), f.clock.now());

        let results = f.breaker.refresh_from_oracle(&oracle);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.as_ref().unwrap().is_some());
        assert_eq!(f.breaker.state(&id()).unwrap(), CircuitState::Restricted);
    }

    #[tokio::test]
    async fn test_transition_event_published() {
        let f = fixture();
        let mut rx = f.breaker.events.subscribe();
        f.breaker.create_circuit(&f.admin, id(), reserve_ratio()).unwrap();
        f.breaker
            .report_metric(&f.reporter, &id(), Decimal::from(150))
            .unwrap();

        match rx.recv().await.unwrap() {
            SettlementEvent::CircuitStateChanged { old, new, trigger, .. } => {
                assert_eq!(old, "Active");
                assert_eq!(new, "Warning");
                assert_eq!(trigger, TransitionTrigger::Automatic);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.breaker.metrics.circuit_transitions.get(), 1);
    }
}
