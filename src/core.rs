//! `ClinicalCore`: the composition root of one node (a device or the
//! hub's write side).
//!
//! Owns the store, the dispatcher with its read models, the device
//! session and outbox, and the gateways. Wiring happens in the builder;
//! afterwards the core is shared freely behind `Arc` clones of its parts.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::command::{ClinicalCommand, CommandContext};
use crate::config::CoreConfig;
use crate::device::{DeviceSession, Outbox};
use crate::dispatcher::EventDispatcher;
use crate::domain::{
    AllergyCommand, AllergyRecord, Appointment, AppointmentCommand, ClinicalNote, Diagnosis,
    DiagnosisCommand, DuplicateCommand, DuplicateResolution, Encounter, EncounterCommand,
    ExaminationFinding, LabResult, NoteCommand, PatientRegistration, Procedure, Referral, Symptom,
    TreatmentPlan, VitalSigns,
};
use crate::gateway::{CommandOutcome, CommandRequest, map_request, outcome_from_error};
use crate::handler::{HandlerEnv, execute_command};
use crate::invariant::InvariantCode;
use crate::projection::Projection;
use crate::query::{QueryGateway, QueryRequest, QueryResult, QueryError, uuid_param};
use crate::readmodel::{DiagnosisStatus, SharedReadModels};
use crate::store::{EventStore, InMemoryEventStore};
use crate::sync::DeviceSync;

/// One node's assembled write side.
pub struct ClinicalCore {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<EventDispatcher>,
    models: SharedReadModels,
    session: Arc<DeviceSession>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    queries: QueryGateway,
    organization_id: Uuid,
}

impl ClinicalCore {
    /// Start building a core for the given device identity.
    pub fn builder(device_id: impl Into<String>, organization_id: Uuid) -> CoreBuilder {
        CoreBuilder {
            device_id: device_id.into(),
            organization_id,
            store: None,
            clock: None,
            config: CoreConfig::default(),
            projections: Vec::new(),
        }
    }

    /// Submit an untrusted request record through the command gateway.
    pub async fn submit(&self, request: CommandRequest) -> CommandOutcome {
        match map_request(&request) {
            Ok((command, ctx)) => self.execute(command, &ctx).await,
            Err(outcome) => outcome,
        }
    }

    /// Execute a typed command against its aggregate.
    pub async fn execute(&self, command: ClinicalCommand, ctx: &CommandContext) -> CommandOutcome {
        let env = HandlerEnv {
            store: self.store.as_ref(),
            dispatcher: self.dispatcher.as_ref(),
            session: self.session.as_ref(),
            outbox: self.outbox.as_ref(),
            clock: &self.clock,
            config: &self.config,
        };
        let models = &self.models;
        let pre = || preconditions(&command, models);

        let result = match command.clone() {
            ClinicalCommand::Patient { patient_id, command } => {
                execute_command::<PatientRegistration>(&env, patient_id, command, ctx, pre).await
            }
            ClinicalCommand::Encounter { encounter_id, command } => {
                execute_command::<Encounter>(&env, encounter_id, command, ctx, pre).await
            }
            ClinicalCommand::Diagnosis { diagnosis_id, command } => {
                execute_command::<Diagnosis>(&env, diagnosis_id, command, ctx, pre).await
            }
            ClinicalCommand::Note { note_id, command } => {
                execute_command::<ClinicalNote>(&env, note_id, command, ctx, pre).await
            }
            ClinicalCommand::Appointment { appointment_id, command } => {
                execute_command::<Appointment>(&env, appointment_id, command, ctx, pre).await
            }
            ClinicalCommand::Allergy { allergy_id, command } => {
                execute_command::<AllergyRecord>(&env, allergy_id, command, ctx, pre).await
            }
            ClinicalCommand::Duplicate { resolution_id, command } => {
                execute_command::<DuplicateResolution>(&env, resolution_id, command, ctx, pre).await
            }
            ClinicalCommand::VitalSigns { observation_id, command } => {
                execute_command::<VitalSigns>(&env, observation_id, command, ctx, pre).await
            }
            ClinicalCommand::Symptom { observation_id, command } => {
                execute_command::<Symptom>(&env, observation_id, command, ctx, pre).await
            }
            ClinicalCommand::ExaminationFinding { observation_id, command } => {
                execute_command::<ExaminationFinding>(&env, observation_id, command, ctx, pre).await
            }
            ClinicalCommand::LabResult { observation_id, command } => {
                execute_command::<LabResult>(&env, observation_id, command, ctx, pre).await
            }
            ClinicalCommand::Procedure { record_id, command } => {
                execute_command::<Procedure>(&env, record_id, command, ctx, pre).await
            }
            ClinicalCommand::Referral { record_id, command } => {
                execute_command::<Referral>(&env, record_id, command, ctx, pre).await
            }
            ClinicalCommand::TreatmentPlan { record_id, command } => {
                execute_command::<TreatmentPlan>(&env, record_id, command, ctx, pre).await
            }
        };

        match result {
            Ok(events) => {
                // Settle the read models before the caller's next command.
                self.dispatcher.drain().await;
                CommandOutcome::Success { events }
            }
            Err(error) => outcome_from_error(error),
        }
    }

    /// Handle a read-side request.
    pub fn query(&self, request: &QueryRequest) -> QueryResult {
        self.queries.handle(request)
    }

    /// Pull anything the live bus missed and settle all projections.
    pub async fn drain(&self) {
        self.dispatcher.catch_up(self.store.as_ref()).await;
        self.dispatcher.drain().await;
    }

    /// The device half of the sync protocol for this node.
    pub fn sync_endpoint(&self) -> DeviceSync {
        DeviceSync::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.session.clone(),
            self.outbox.clone(),
            self.clock.clone(),
            self.config.clone(),
            self.organization_id,
        )
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn models(&self) -> &SharedReadModels {
        &self.models
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }
}

/// The explicit cross-aggregate precondition table, one entry per command.
///
/// Checks consult the local read models only; offline they may be stale,
/// which is accepted and reconciled by the sync-time compensation engine.
fn preconditions(command: &ClinicalCommand, models: &SharedReadModels) -> Result<(), InvariantCode> {
    let patient_registered = |patient: Uuid| match models.patient_status(patient) {
        None => Err(InvariantCode::PL4),
        Some(status) if status.is_terminal() => Err(InvariantCode::PL2),
        Some(_) => Ok(()),
    };
    let encounter_active = |encounter: Uuid, code: InvariantCode| {
        match models.encounter_state(encounter) {
            Some(state) if state.is_active() => Ok(()),
            _ => Err(code),
        }
    };

    match command {
        // Patient lifecycle is entirely intra-aggregate.
        ClinicalCommand::Patient { .. } => Ok(()),

        ClinicalCommand::Encounter { command, .. } => match command {
            EncounterCommand::CheckIn {
                patient_id,
                practitioner_id,
                ..
            } => {
                patient_registered(*patient_id)?;
                if models.active_encounters_for(*patient_id, *practitioner_id) > 0 {
                    return Err(InvariantCode::EP3);
                }
                Ok(())
            }
            _ => Ok(()),
        },

        ClinicalCommand::Diagnosis { command, .. } => match command {
            DiagnosisCommand::Make {
                patient_id,
                encounter_id,
                ..
            } => {
                patient_registered(*patient_id)?;
                encounter_active(*encounter_id, InvariantCode::CJ1)
            }
            _ => Ok(()),
        },

        ClinicalCommand::Note { command, .. } => match command {
            NoteCommand::Author { patient_id, .. } => patient_registered(*patient_id),
            _ => Ok(()),
        },

        ClinicalCommand::Appointment { appointment_id, command } => match command {
            AppointmentCommand::Request { patient_id, .. } => patient_registered(*patient_id),
            AppointmentCommand::Confirm { .. }
            | AppointmentCommand::Reschedule { .. } => {
                // Keeping an appointment alive for a terminal patient is
                // refused when the local model already knows better.
                match models
                    .appointment_patient(*appointment_id)
                    .and_then(|p| models.patient_status(p))
                {
                    Some(status) if status.is_terminal() => Err(InvariantCode::PL2),
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        },

        ClinicalCommand::Allergy { command, .. } => match command {
            AllergyCommand::Identify { patient_id, .. } => patient_registered(*patient_id),
            AllergyCommand::Refute { .. } => Ok(()),
        },

        ClinicalCommand::Duplicate { command, .. } => match command {
            DuplicateCommand::Flag {
                primary_patient_id,
                duplicate_patient_id,
                ..
            } => {
                patient_registered(*primary_patient_id)?;
                patient_registered(*duplicate_patient_id)
            }
            DuplicateCommand::Resolve { .. } => Ok(()),
        },

        // Observations and care facts require a registered patient and an
        // active encounter.
        ClinicalCommand::VitalSigns { command: crate::domain::VitalSignsCommand::Record { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }
        ClinicalCommand::Symptom { command: crate::domain::SymptomCommand::Report { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }
        ClinicalCommand::ExaminationFinding { command: crate::domain::ExaminationFindingCommand::Record { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }
        ClinicalCommand::LabResult { command: crate::domain::LabResultCommand::Record { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }
        ClinicalCommand::Procedure { command: crate::domain::ProcedureCommand::Record { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }
        ClinicalCommand::Referral { command: crate::domain::ReferralCommand::Issue { patient_id, encounter_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            encounter_active(*encounter_id, InvariantCode::CO1)
        }

        ClinicalCommand::TreatmentPlan { command: crate::domain::TreatmentPlanCommand::Establish { patient_id, diagnosis_id, .. }, .. } => {
            patient_registered(*patient_id)?;
            match models.diagnosis_status(*diagnosis_id) {
                None => Err(InvariantCode::CJ2),
                Some(DiagnosisStatus::Resolved) => Err(InvariantCode::CJ5),
                Some(DiagnosisStatus::Made) => Ok(()),
            }
        }
    }
}

/// Builder for [`ClinicalCore`].
pub struct CoreBuilder {
    device_id: String,
    organization_id: Uuid,
    store: Option<Arc<dyn EventStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: CoreConfig,
    projections: Vec<Box<dyn Projection>>,
}

impl CoreBuilder {
    /// Use a specific store; defaults to a fresh in-memory store.
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Inject a clock; defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an additional projection beyond the built-in read models.
    pub fn projection(mut self, projection: Box<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn build(self) -> ClinicalCore {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let models = SharedReadModels::new();

        let mut dispatcher = EventDispatcher::new(self.config.clone(), clock.clone());
        dispatcher.register(Box::new(models.clone()));
        for projection in self.projections {
            dispatcher.register(projection);
        }

        let mut queries = QueryGateway::new();
        register_builtin_queries(&mut queries, &models);

        ClinicalCore {
            store,
            dispatcher: Arc::new(dispatcher),
            models,
            session: Arc::new(DeviceSession::new(self.device_id)),
            outbox: Arc::new(Outbox::new()),
            clock,
            config: self.config,
            queries,
            organization_id: self.organization_id,
        }
    }
}

/// The built-in status queries over the handler read models.
fn register_builtin_queries(queries: &mut QueryGateway, models: &SharedReadModels) {
    let m = models.clone();
    queries.register("patient_status", move |params| {
        let id = uuid_param(params, "patient_id")?;
        let status = m
            .patient_status(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({ "patient_id": id, "status": status }))
    });
    let m = models.clone();
    queries.register("encounter_state", move |params| {
        let id = uuid_param(params, "encounter_id")?;
        let state = m
            .encounter_state(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({ "encounter_id": id, "state": state }))
    });
    let m = models.clone();
    queries.register("diagnosis_status", move |params| {
        let id = uuid_param(params, "diagnosis_id")?;
        let status = m
            .diagnosis_status(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({ "diagnosis_id": id, "status": status }))
    });
    let m = models.clone();
    queries.register("appointment_status", move |params| {
        let id = uuid_param(params, "appointment_id")?;
        let status = m
            .appointment_status(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({ "appointment_id": id, "status": status }))
    });
    let m = models.clone();
    queries.register("performer_role", move |params| {
        let id = uuid_param(params, "actor_id")?;
        let role = m
            .performer_role(id)
            .ok_or_else(|| QueryError::NotFound(id.to_string()))?;
        Ok(serde_json::json!({ "actor_id": id, "role": role }))
    });
}
