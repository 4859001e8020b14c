//! Demo task set: payload types, handlers, and the producer batch
//!
//! The handlers only log their simulated side effect; the interesting part
//! is the delivery policy each job exercises (queues, retries, delays, the
//! recurring welcome email).

use std::collections::HashMap;
use std::time::Duration;

use ferroq_core::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const TYPE_EMAIL_DELIVERY: &str = "email:deliver";
pub const TYPE_EMAIL_WELCOME: &str = "email:welcome";
pub const TYPE_IMAGE_RESIZE: &str = "image:resize";

/// Recurring schedule for the welcome email
pub const RECURRING_WELCOME_EXPR: &str = "@every 30s";

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailDeliveryPayload {
    pub user_id: u64,
    pub template_id: String,
    pub data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailWelcomePayload {
    pub user_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageResizePayload {
    pub image_id: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub user_id: u64,
}

/// Build the worker-side registry with all demo handlers
pub fn registry() -> Result<JobRegistry, RegistryError> {
    let mut registry = JobRegistry::new();
    registry.register(TYPE_EMAIL_DELIVERY, handle_email_delivery)?;
    registry.register(TYPE_EMAIL_WELCOME, handle_email_welcome)?;
    registry.register(TYPE_IMAGE_RESIZE, handle_image_resize)?;
    registry.register(CATCH_ALL_TYPE, handle_unknown)?;
    Ok(registry)
}

async fn handle_email_delivery(ctx: JobContext) -> Result<(), JobError> {
    let payload: EmailDeliveryPayload = ctx.decode()?;
    info!(
        user_id = payload.user_id,
        template_id = %payload.template_id,
        "sending email"
    );
    // Simulated delivery latency
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(user_id = payload.user_id, "email sent");
    Ok(())
}

async fn handle_email_welcome(ctx: JobContext) -> Result<(), JobError> {
    let payload: EmailWelcomePayload = ctx.decode()?;
    info!(user_id = payload.user_id, "sending welcome email");
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(user_id = payload.user_id, "welcome email sent");
    Ok(())
}

async fn handle_image_resize(ctx: JobContext) -> Result<(), JobError> {
    let payload: ImageResizePayload = ctx.decode()?;
    info!(
        image_id = %payload.image_id,
        user_id = payload.user_id,
        width = payload.width,
        height = payload.height,
        format = %payload.format,
        "resizing image"
    );
    tokio::time::sleep(Duration::from_secs(3)).await;
    info!(image_id = %payload.image_id, "image resized");
    Ok(())
}

async fn handle_unknown(ctx: JobContext) -> Result<(), JobError> {
    warn!(job_type = %ctx.job_type, "received an unknown job type");
    Ok(())
}

/// Template the scheduler stamps welcome emails from, with a fresh user id
/// per tick
pub fn recurring_welcome_template() -> JobTemplate {
    JobTemplate::generated(TYPE_EMAIL_WELCOME, || {
        let user_id = 42 + rand::thread_rng().gen_range(0..1000);
        serde_json::to_vec(&EmailWelcomePayload { user_id }).unwrap_or_default()
    })
}

/// Producer-side demo source: one batch of three jobs per cycle
pub struct DemoSource;

fn demo_batch() -> Result<Vec<(Job, JobOptions)>, JobError> {
    let mut data = HashMap::new();
    data.insert(
        "subject".to_string(),
        serde_json::Value::String("Welcome!".to_string()),
    );
    data.insert(
        "body".to_string(),
        serde_json::Value::String("Excited to have you!".to_string()),
    );

    Ok(vec![
        (
            Job::json(
                TYPE_EMAIL_DELIVERY,
                &EmailDeliveryPayload {
                    user_id: 123,
                    template_id: "welcome_template".to_string(),
                    data,
                },
            )?,
            JobOptions::new(),
        ),
        (
            Job::json(
                TYPE_IMAGE_RESIZE,
                &ImageResizePayload {
                    image_id: "profile.jpg".to_string(),
                    width: 800,
                    height: 600,
                    format: "jpeg".to_string(),
                    user_id: 123,
                },
            )?,
            JobOptions::new().queue("critical").max_retries(5),
        ),
        (
            Job::json(TYPE_EMAIL_WELCOME, &EmailWelcomePayload { user_id: 456 })?,
            JobOptions::new().process_in(Duration::from_secs(60)),
        ),
    ])
}

impl JobSource for DemoSource {
    fn next_batch(&mut self) -> Vec<(Job, JobOptions)> {
        match demo_batch() {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "failed to build demo batch");
                vec![]
            }
        }
    }
}
