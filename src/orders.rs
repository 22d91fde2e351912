//! Service orders: the record of what happened during a visit

use chrono::{NaiveDate, NaiveDateTime};

use crate::context::Context;
use crate::error::{AppError, AppResult};
use crate::events::AppEvent;
use crate::models::{
    ClockTime, DevicePestCount, PestCount, Schedule, ServiceOrder, ServiceOrderStatus,
    ServiceOrderUpdate,
};
use crate::store::{Collection, SERVICE_ORDER_SEQUENCE, now_rfc3339};

#[derive(Clone)]
pub struct ServiceOrders {
    ctx: Context,
}

impl ServiceOrders {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Newest first, optionally only those of one schedule
    pub fn list(&self, schedule_id: Option<&str>) -> AppResult<Vec<ServiceOrder>> {
        let mut orders: Vec<ServiceOrder> = self.ctx.load(Collection::ServiceOrders)?;
        if let Some(schedule_id) = schedule_id {
            orders.retain(|o| o.schedule_id == schedule_id);
        }
        orders.sort_by(|a, b| b.order_number.cmp(&a.order_number));
        Ok(orders)
    }

    pub fn get(&self, id: &str) -> AppResult<ServiceOrder> {
        self.ctx
            .find(Collection::ServiceOrders, id)?
            .ok_or_else(|| AppError::not_found("Ordem de serviço", id))
    }

    /// Applies the on-site capture (devices, product, signatures, notes)
    pub fn update(&self, id: &str, update: ServiceOrderUpdate) -> AppResult<ServiceOrder> {
        let _guard = self.ctx.write()?;
        let mut order = self.get(id)?;

        if let Some(devices) = update.devices {
            order.devices = devices;
        }
        if update.product.is_some() {
            order.product = update.product;
        }
        if let Some(amount) = update.product_amount {
            order.product_amount = amount;
        }
        if let Some(target) = update.target_pest {
            order.target_pest = target;
        }
        if let Some(counts) = update.pest_counts {
            order.pest_counts = tally(counts)?;
        }
        if let Some(location) = update.location {
            order.location = location;
        }
        if let Some(method) = update.application_method {
            order.application_method = method;
        }
        if let Some(observations) = update.observations {
            order.observations = observations;
        }
        if let Some(signatures) = update.signatures {
            order.signatures = signatures;
        }
        order.updated_at = now_rfc3339();

        self.ctx.save_record(Collection::ServiceOrders, &order)?;
        self.publish(&order);
        Ok(order)
    }

    /// New in-progress order for a started visit. Caller holds the write lock.
    pub(crate) fn open(&self, schedule: &Schedule, now: NaiveDateTime) -> AppResult<ServiceOrder> {
        let order = ServiceOrder {
            start_time: Some(ClockTime::from_time(now.time())),
            ..self.blank(schedule, ServiceOrderStatus::InProgress)?
        };
        self.ctx.save_record(Collection::ServiceOrders, &order)?;
        self.publish(&order);
        Ok(order)
    }

    /// Completes the open order of the schedule, creating one when the visit
    /// was started elsewhere. Caller holds the write lock.
    pub(crate) fn complete(&self, schedule: &Schedule, now: NaiveDateTime) -> AppResult<ServiceOrder> {
        let open = self
            .list(Some(&schedule.id))?
            .into_iter()
            .find(|o| o.status == ServiceOrderStatus::InProgress);

        let mut order = match open {
            Some(order) => order,
            None => ServiceOrder {
                start_time: schedule.started_at,
                ..self.blank(schedule, ServiceOrderStatus::InProgress)?
            },
        };
        order.status = ServiceOrderStatus::Completed;
        order.end_time = Some(ClockTime::from_time(now.time()));
        order.updated_at = now_rfc3339();

        self.ctx.save_record(Collection::ServiceOrders, &order)?;
        self.publish(&order);
        Ok(order)
    }

    /// Cancelled order carrying the reason the visit did not happen.
    /// Caller holds the write lock.
    pub(crate) fn no_service(&self, schedule: &Schedule, reason: &str) -> AppResult<ServiceOrder> {
        let order = ServiceOrder {
            no_service_reason: Some(reason.to_string()),
            ..self.blank(schedule, ServiceOrderStatus::Cancelled)?
        };
        self.ctx.save_record(Collection::ServiceOrders, &order)?;
        self.publish(&order);
        Ok(order)
    }

    /// Completed order for a visit registered after the fact. Caller holds
    /// the write lock.
    pub(crate) fn record_past(
        &self,
        schedule: &Schedule,
        date: NaiveDate,
        start: ClockTime,
        end: ClockTime,
    ) -> AppResult<ServiceOrder> {
        let order = ServiceOrder {
            date,
            start_time: Some(start),
            end_time: Some(end),
            retroactive: true,
            ..self.blank(schedule, ServiceOrderStatus::Completed)?
        };
        self.ctx.save_record(Collection::ServiceOrders, &order)?;
        self.publish(&order);
        Ok(order)
    }

    fn blank(&self, schedule: &Schedule, status: ServiceOrderStatus) -> AppResult<ServiceOrder> {
        let now = now_rfc3339();
        Ok(ServiceOrder {
            id: uuid::Uuid::new_v4().to_string(),
            order_number: self.ctx.store.next_sequence(SERVICE_ORDER_SEQUENCE)?,
            schedule_id: schedule.id.clone(),
            client_id: schedule.client_id.clone(),
            client_name: schedule.client_name.clone(),
            client_address: schedule.client_address.clone(),
            service_type: schedule.service_type,
            date: schedule.date,
            start_time: None,
            end_time: None,
            status,
            devices: Vec::new(),
            product: None,
            product_amount: String::new(),
            target_pest: String::new(),
            pest_counts: Vec::new(),
            location: String::new(),
            application_method: String::new(),
            observations: String::new(),
            no_service_reason: None,
            signatures: Default::default(),
            retroactive: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    fn publish(&self, order: &ServiceOrder) {
        self.ctx.publish(AppEvent::ServiceOrderChanged {
            order_id: order.id.clone(),
            schedule_id: order.schedule_id.clone(),
            status: order.status,
        });
    }
}

/// Checks the per-device tallies and folds repeated pest names into one entry
fn tally(counts: Vec<DevicePestCount>) -> AppResult<Vec<DevicePestCount>> {
    counts
        .into_iter()
        .map(|device| {
            if device.device_type.trim().is_empty() {
                return Err(AppError::Validation("Informe o tipo do dispositivo".into()));
            }
            let mut pests: Vec<PestCount> = Vec::new();
            for pest in device.pests {
                let name = pest.name.trim();
                if name.is_empty() {
                    return Err(AppError::Validation("Informe o nome da praga".into()));
                }
                match pests.iter_mut().find(|p| p.name == name) {
                    Some(existing) => existing.count = existing.count.saturating_add(pest.count),
                    None => pests.push(PestCount {
                        name: name.to_string(),
                        count: pest.count,
                    }),
                }
            }
            Ok(DevicePestCount { pests, ..device })
        })
        .collect()
}
