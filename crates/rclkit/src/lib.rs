// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Async ROS 2 style client runtime.
//!
//! The runtime sits on top of a [`Transport`](transport::Transport) and
//! provides:
//!
//! - [`WaitSet`]: polls the transport for ready entities and dispatches
//!   their callbacks in a fixed order;
//! - request/response correlation for service clients and action clients;
//! - the action goal lifecycle on both sides: [`action::ActionServer`] runs
//!   goals and retains their results, [`action::ActionClient`] sends goals
//!   and fans feedback and status out to watchers.
//!
//! ```rust,no_run
//! # async fn example() -> rclkit::Result<()> {
//! use rclkit::{Context, QosProfile};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! rclkit::logging::init("info");
//! let context = Context::loopback();
//! let node = context.create_node("talker", "/demo")?;
//! let publisher = node.create_publisher::<String>("chatter", &QosProfile::default())?;
//! let _timer = node.create_timer(Duration::from_millis(100), move |_| {
//!     let _ = publisher.publish(&"hello".to_string());
//! })?;
//! context.spin(&CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod config;
mod context;
pub mod correlator;
mod error;
pub mod logging;
mod message;
mod node;
mod pubsub;
pub mod qos;
mod service;
mod timer;
pub mod transport;
mod wait_set;
mod waitable;

pub use config::{ConfigError, RuntimeConfig};
pub use context::Context;
pub use error::{Error, Result};
pub use message::{Message, ServiceType, Time};
pub use node::Node;
pub use pubsub::{Publisher, Subscription};
pub use qos::{ActionQos, Durability, History, Liveliness, QosProfile, Reliability};
pub use service::{Client, RequestHandler, ResponseSender, Service};
pub use timer::Timer;
pub use wait_set::{GuardCondition, WaitSet};
pub use waitable::{LoopWaker, Reservation, Waitable, WaitableKind};
