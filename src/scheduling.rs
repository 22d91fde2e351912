//! Scheduling: validation, conflict detection and the visit lifecycle

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::clients::ClientRegistry;
use crate::context::Context;
use crate::error::{AppError, AppResult};
use crate::events::AppEvent;
use crate::models::{
    ClockTime, Schedule, ScheduleInput, ScheduleStatus, ServiceOrder, ServiceType,
};
use crate::orders::ServiceOrders;
use crate::store::{Collection, now_rfc3339};

/// Reason recorded when a pending visit's window passes without a service
pub const MISSED_REASON: &str = "Não atendido";

/// True when `[new_start, new_end)` collides with `[start, end)`.
///
/// Back-to-back windows (`new_end == start` or `new_start == end`) do not
/// collide.
pub fn overlaps(
    new_start: ClockTime,
    new_end: ClockTime,
    start: ClockTime,
    end: ClockTime,
) -> bool {
    (new_start >= start && new_start < end)
        || (new_end > start && new_end <= end)
        || (new_start <= start && new_end >= end)
}

/// Time window being booked
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub date: NaiveDate,
    pub start: ClockTime,
    pub end: ClockTime,
    /// The schedule being edited, never a conflict with itself
    pub exclude_id: Option<&'a str>,
}

/// First schedule on the same date whose window overlaps the candidate.
/// Cancelled schedules do not hold their slot.
pub fn find_conflict<'s>(candidate: &Candidate<'_>, existing: &'s [Schedule]) -> Option<&'s Schedule> {
    existing.iter().find(|s| {
        Some(s.id.as_str()) != candidate.exclude_id
            && s.status != ScheduleStatus::Cancelled
            && s.date == candidate.date
            && overlaps(candidate.start, candidate.end, s.start_time, s.end_time)
    })
}

/// Query filters for the agenda
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleFilter {
    pub status: Option<ScheduleStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub client_id: Option<String>,
}

impl ScheduleFilter {
    fn matches(&self, schedule: &Schedule) -> bool {
        self.status.is_none_or(|s| s == schedule.status)
            && self.start_date.is_none_or(|d| schedule.date >= d)
            && self.end_date.is_none_or(|d| schedule.date <= d)
            && self
                .client_id
                .as_deref()
                .is_none_or(|c| c == schedule.client_id)
    }
}

/// Dashboard counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub today: usize,
    pub today_pending: usize,
}

/// Result of a lifecycle transition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub schedule: Schedule,
    pub service_order: ServiceOrder,
}

/// A visit that already happened, registered after the fact
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetroactiveVisit {
    /// Defaults to the schedule's date
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
}

struct ValidSchedule {
    client_id: String,
    date: NaiveDate,
    start: ClockTime,
    end: ClockTime,
    service_type: ServiceType,
}

fn validate(input: &ScheduleInput) -> AppResult<ValidSchedule> {
    let client_id = input
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("Por favor, selecione um cliente".into()))?;

    let service_type = input
        .service_type
        .ok_or_else(|| AppError::Validation("Por favor, selecione o tipo de serviço".into()))?;

    let (Some(start), Some(end)) = (
        input.start_time.as_deref().filter(|t| !t.is_empty()),
        input.end_time.as_deref().filter(|t| !t.is_empty()),
    ) else {
        return Err(AppError::Validation(
            "Por favor, selecione os horários de início e fim".into(),
        ));
    };
    let start: ClockTime = start
        .parse()
        .map_err(|e| AppError::Validation(format!("{e}")))?;
    let end: ClockTime = end
        .parse()
        .map_err(|e| AppError::Validation(format!("{e}")))?;

    let date = input
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| AppError::Validation("Data inválida, use yyyy-MM-dd".into()))?;

    if start >= end {
        return Err(AppError::Validation(
            "O horário de fim deve ser depois do horário de início".into(),
        ));
    }

    Ok(ValidSchedule {
        client_id: client_id.to_string(),
        date,
        start,
        end,
        service_type,
    })
}

fn check_conflict(schedules: &[Schedule], candidate: &Candidate<'_>) -> AppResult<()> {
    match find_conflict(candidate, schedules) {
        Some(existing) => Err(AppError::Conflict {
            existing_id: existing.id.clone(),
            date: existing.date,
            start: existing.start_time,
            end: existing.end_time,
        }),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Context,
    clients: ClientRegistry,
    orders: ServiceOrders,
}

impl Scheduler {
    pub fn new(ctx: Context) -> Self {
        Self {
            clients: ClientRegistry::new(ctx.clone()),
            orders: ServiceOrders::new(ctx.clone()),
            ctx,
        }
    }

    /// Sorted by date, then start time
    pub fn list(&self, filter: &ScheduleFilter) -> AppResult<Vec<Schedule>> {
        let mut schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        schedules.retain(|s| filter.matches(s));
        schedules.sort_by(|a, b| (a.date, a.start_time).cmp(&(b.date, b.start_time)));
        Ok(schedules)
    }

    pub fn get(&self, id: &str) -> AppResult<Schedule> {
        self.ctx
            .find(Collection::Schedules, id)?
            .ok_or_else(|| AppError::not_found("Agendamento", id))
    }

    /// Dry-run of the booking rules for a window, nothing is stored
    pub fn check_availability(&self, input: &ScheduleInput, exclude_id: Option<&str>) -> AppResult<()> {
        let valid = validate(input)?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        check_conflict(
            &schedules,
            &Candidate {
                date: valid.date,
                start: valid.start,
                end: valid.end,
                exclude_id,
            },
        )
    }

    pub fn create(&self, input: ScheduleInput) -> AppResult<Schedule> {
        let valid = validate(&input)?;
        let client = self
            .clients
            .get(&valid.client_id)
            .map_err(|_| AppError::Validation("Cliente não encontrado".into()))?;

        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        check_conflict(
            &schedules,
            &Candidate {
                date: valid.date,
                start: valid.start,
                end: valid.end,
                exclude_id: None,
            },
        )?;

        let now = now_rfc3339();
        let schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client.id.clone(),
            client_name: client.name.clone(),
            client_address: client.full_address(),
            date: valid.date,
            start_time: valid.start,
            end_time: valid.end,
            service_type: valid.service_type,
            status: ScheduleStatus::Pending,
            technician: input.technician.filter(|t| !t.trim().is_empty()),
            notes: input.notes.unwrap_or_default(),
            started_at: None,
            completed_at: None,
            cancel_reason: None,
            created_at: now.clone(),
            updated_at: now,
        };

        self.ctx.save_record(Collection::Schedules, &schedule)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        tracing::info!(
            schedule_id = %schedule.id,
            date = %schedule.date,
            start = %schedule.start_time,
            end = %schedule.end_time,
            "Schedule created"
        );
        Ok(schedule)
    }

    /// Edits the booking; the status only moves through transitions
    pub fn update(&self, id: &str, input: ScheduleInput) -> AppResult<Schedule> {
        let valid = validate(&input)?;
        let client = self
            .clients
            .get(&valid.client_id)
            .map_err(|_| AppError::Validation("Cliente não encontrado".into()))?;

        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let existing = schedules
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Agendamento", id))?;
        check_conflict(
            &schedules,
            &Candidate {
                date: valid.date,
                start: valid.start,
                end: valid.end,
                exclude_id: Some(id),
            },
        )?;

        let schedule = Schedule {
            client_id: client.id.clone(),
            client_name: client.name.clone(),
            client_address: client.full_address(),
            date: valid.date,
            start_time: valid.start,
            end_time: valid.end,
            service_type: valid.service_type,
            technician: input.technician.filter(|t| !t.trim().is_empty()),
            notes: input.notes.unwrap_or(existing.notes.clone()),
            updated_at: now_rfc3339(),
            ..existing
        };

        self.ctx.save_record(Collection::Schedules, &schedule)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        Ok(schedule)
    }

    /// Hard delete, whatever the status
    pub fn delete(&self, id: &str) -> AppResult<()> {
        let _guard = self.ctx.write()?;
        if !self.ctx.delete_record::<Schedule>(Collection::Schedules, id)? {
            return Err(AppError::not_found("Agendamento", id));
        }
        self.ctx.publish(AppEvent::ScheduleDeleted {
            schedule_id: id.to_string(),
        });
        tracing::info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    pub fn start(&self, id: &str) -> AppResult<Transition> {
        self.start_at(id, Local::now().naive_local())
    }

    /// pending -> in_progress; only one visit may be in progress at a time
    pub fn start_at(&self, id: &str, now: NaiveDateTime) -> AppResult<Transition> {
        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let mut schedule = transition_target(&schedules, id, ScheduleStatus::InProgress)?;

        if let Some(active) = schedules
            .iter()
            .find(|s| s.status == ScheduleStatus::InProgress && s.id != id)
        {
            return Err(AppError::AnotherServiceActive(active.id.clone()));
        }

        schedule.status = ScheduleStatus::InProgress;
        schedule.started_at = Some(ClockTime::from_time(now.time()));
        schedule.updated_at = now_rfc3339();
        self.ctx.save_record(Collection::Schedules, &schedule)?;

        let service_order = self.orders.open(&schedule, now)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        tracing::info!(schedule_id = %id, order = service_order.order_number, "Service started");
        Ok(Transition {
            schedule,
            service_order,
        })
    }

    pub fn finish(&self, id: &str) -> AppResult<Transition> {
        self.finish_at(id, Local::now().naive_local())
    }

    /// in_progress -> completed
    pub fn finish_at(&self, id: &str, now: NaiveDateTime) -> AppResult<Transition> {
        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let mut schedule = transition_target(&schedules, id, ScheduleStatus::Completed)?;

        schedule.status = ScheduleStatus::Completed;
        schedule.completed_at = Some(ClockTime::from_time(now.time()));
        schedule.updated_at = now_rfc3339();
        self.ctx.save_record(Collection::Schedules, &schedule)?;

        let service_order = self.orders.complete(&schedule, now)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        tracing::info!(schedule_id = %id, order = service_order.order_number, "Service finished");
        Ok(Transition {
            schedule,
            service_order,
        })
    }

    pub fn register_retroactive(&self, id: &str, visit: &RetroactiveVisit) -> AppResult<Transition> {
        self.register_retroactive_at(id, visit, Local::now().naive_local())
    }

    /// pending -> completed in one step, for a visit that was not tracked live
    pub fn register_retroactive_at(
        &self,
        id: &str,
        visit: &RetroactiveVisit,
        now: NaiveDateTime,
    ) -> AppResult<Transition> {
        if visit.end_time <= visit.start_time {
            return Err(AppError::Validation(
                "O horário de fim deve ser posterior ao de início".into(),
            ));
        }

        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let mut schedule = transition_target(&schedules, id, ScheduleStatus::InProgress)?;
        let date = visit.date.unwrap_or(schedule.date);
        if date.and_time(visit.end_time.as_time()) > now {
            return Err(AppError::Validation(
                "Serviço retroativo não pode terminar no futuro".into(),
            ));
        }

        schedule.status = ScheduleStatus::Completed;
        schedule.started_at = Some(visit.start_time);
        schedule.completed_at = Some(visit.end_time);
        schedule.updated_at = now_rfc3339();
        self.ctx.save_record(Collection::Schedules, &schedule)?;

        let service_order = self
            .orders
            .record_past(&schedule, date, visit.start_time, visit.end_time)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        tracing::info!(
            schedule_id = %id,
            order = service_order.order_number,
            %date,
            "Retroactive service registered"
        );
        Ok(Transition {
            schedule,
            service_order,
        })
    }

    /// pending -> cancelled, recorded as a no-service order
    pub fn cancel(&self, id: &str, reason: Option<&str>) -> AppResult<Transition> {
        let _guard = self.ctx.write()?;
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(MISSED_REASON);
        self.cancel_locked(&schedules, id, reason)
    }

    fn cancel_locked(&self, schedules: &[Schedule], id: &str, reason: &str) -> AppResult<Transition> {
        let mut schedule = transition_target(schedules, id, ScheduleStatus::Cancelled)?;

        schedule.status = ScheduleStatus::Cancelled;
        schedule.cancel_reason = Some(reason.to_string());
        schedule.updated_at = now_rfc3339();
        self.ctx.save_record(Collection::Schedules, &schedule)?;

        let service_order = self.orders.no_service(&schedule, reason)?;
        self.ctx.publish(AppEvent::schedule_changed(&schedule));
        tracing::info!(schedule_id = %id, reason, "Schedule cancelled");
        Ok(Transition {
            schedule,
            service_order,
        })
    }

    pub fn reconcile_missed(&self) -> AppResult<Vec<Schedule>> {
        self.reconcile_missed_at(Local::now().naive_local())
    }

    /// Cancels pending visits whose window has already ended
    pub fn reconcile_missed_at(&self, now: NaiveDateTime) -> AppResult<Vec<Schedule>> {
        let _guard = self.ctx.write()?;
        let now_time = ClockTime::from_time(now.time());
        let today = now.date();

        let mut schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let missed: Vec<String> = schedules
            .iter()
            .filter(|s| s.status == ScheduleStatus::Pending)
            .filter(|s| s.date < today || (s.date == today && s.end_time <= now_time))
            .map(|s| s.id.clone())
            .collect();

        let mut cancelled = Vec::with_capacity(missed.len());
        for id in missed {
            let transition = self.cancel_locked(&schedules, &id, MISSED_REASON)?;
            if let Some(slot) = schedules.iter_mut().find(|s| s.id == id) {
                *slot = transition.schedule.clone();
            }
            cancelled.push(transition.schedule);
        }

        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Missed visits cancelled");
        }
        Ok(cancelled)
    }

    pub fn stats(&self, today: NaiveDate) -> AppResult<ScheduleStats> {
        let schedules: Vec<Schedule> = self.ctx.load(Collection::Schedules)?;
        let mut stats = ScheduleStats {
            total: schedules.len(),
            ..Default::default()
        };
        for schedule in &schedules {
            match schedule.status {
                ScheduleStatus::Pending => stats.pending += 1,
                ScheduleStatus::InProgress => stats.in_progress += 1,
                ScheduleStatus::Completed => stats.completed += 1,
                ScheduleStatus::Cancelled => stats.cancelled += 1,
            }
            if schedule.date == today {
                stats.today += 1;
                if schedule.status == ScheduleStatus::Pending {
                    stats.today_pending += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// Copy of the schedule if `next` is a legal step from its current status
fn transition_target(schedules: &[Schedule], id: &str, next: ScheduleStatus) -> AppResult<Schedule> {
    let schedule = schedules
        .iter()
        .find(|s| s.id == id)
        .ok_or_else(|| AppError::not_found("Agendamento", id))?;
    if !schedule.status.can_transition_to(next) {
        return Err(AppError::InvalidTransition {
            from: schedule.status,
            to: next,
        });
    }
    Ok(schedule.clone())
}
