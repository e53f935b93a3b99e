//! Storefront API library
//!
//! Order and refund reconciliation for a storefront: idempotent payment
//! webhooks, cart-to-order materialization, refund accounting, stock guarding
//! and the notification side effects that follow them.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod migrator;
pub mod openapi;
pub mod rate_limiter;
pub mod retry;
pub mod services;
pub mod tracing;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::auth::InternalCredentials;
use crate::rate_limiter::{build_admission, AdmissionControl};
use crate::services::{notifications::Notifier, payments::PaymentProvider};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub credentials: InternalCredentials,
    pub refund_admission: Arc<dyn AdmissionControl>,
    pub webhook_admission: Arc<dyn AdmissionControl>,
    pub services: handlers::AppServices,
}

impl AppState {
    /// Wires services and admission control from configuration.
    ///
    /// Admission buckets are shared through Redis only when a client is given.
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        redis: Option<Arc<redis::Client>>,
    ) -> Self {
        let shared = |suffix: &str| {
            redis
                .clone()
                .map(|client| (client, format!("{}:{}", config.rate_limit_namespace, suffix)))
        };
        let refund_admission = build_admission(config.refund_bucket(), shared("refund"));
        let webhook_admission = build_admission(config.webhook_bucket(), shared("webhook"));

        let services = handlers::AppServices::new(db.clone(), &config, provider, notifier);

        Self {
            db,
            credentials: InternalCredentials::from_config(&config),
            config: Arc::new(config),
            refund_admission,
            webhook_admission,
            services,
        }
    }
}

/// Internal order administration; every route requires the internal key.
fn admin_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/orders/:id/fulfillment",
            put(handlers::orders::update_fulfillment),
        )
        .route("/orders/:id/tracking", put(handlers::orders::set_tracking))
        .route(
            "/orders/:id/resend-confirmation",
            post(handlers::orders::resend_confirmation),
        )
        .route(
            "/customers/:id/link-guest-orders",
            post(handlers::orders::link_guest_orders),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::common::require_internal_key,
        ))
}

pub fn api_v1_routes(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/webhooks/payments", post(handlers::webhooks::payment_webhook))
        // admission and credential checks run inside the handler, in that order
        .route("/orders/:id/refund", post(handlers::refunds::issue_refund))
        .route(
            "/checkout/session",
            post(handlers::checkout::create_checkout_session),
        )
        .merge(admin_routes(state))
}

/// Full application router with request ids and HTTP tracing.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/api/v1", api_v1_routes(&state))
        .merge(openapi::openapi_routes())
        // HTTP tracing layer for consistent request/response telemetry
        .layer(crate::tracing::http_trace_layer())
        // Ensure every request carries a request id for traceability
        .layer(middleware::from_fn(crate::tracing::request_id_middleware))
        .with_state(state)
}
