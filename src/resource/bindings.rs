//! Node resources: audio session parameters, duty-cycle timing, diagnostics
//! and device status.

use super::{ReadOnly, ReadWrite, ResourceError, ResourceRegistry, Value};
use crate::audio::{AudioPipeline, StartError};
use crate::config::{ConfigError, DutyCycleConfig, Gain, ServerUrl, TransportMode};
use crate::controller::ControllerHandle;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use log::{info, warn};
use std::sync::Arc;

type DiagField = (&'static str, fn(&DiagnosticsSnapshot) -> Value);

const DIAG_FIELDS: &[DiagField] = &[
    ("diag/up_time_secs", |s| Value::Int(s.up_time_secs as i64)),
    ("diag/total_datagrams", |s| Value::Int(s.total_datagrams as i64)),
    ("diag/total_bytes", |s| Value::Int(s.total_bytes as i64)),
    ("diag/bytes_per_second", |s| Value::Int(s.bytes_per_second as i64)),
    ("diag/send_failures", |s| Value::Int(s.send_failures as i64)),
    ("diag/worst_send_us", |s| Value::Int(s.worst_send_us as i64)),
    ("diag/average_send_us", |s| Value::Int(s.average_send_us as i64)),
    ("diag/percent_over_budget", |s| {
        Value::Float(s.percent_over_budget as f64)
    }),
    ("diag/min_free_datagrams", |s| {
        Value::Int(s.min_free_datagrams.map_or(-1, |n| n as i64))
    }),
    ("diag/overflow_active", |s| Value::Bool(s.overflow_active)),
    ("diag/overflow_dropped", |s| Value::Int(s.overflow_dropped as i64)),
    ("diag/capture_faults", |s| Value::Int(s.capture_faults as i64)),
];

type DutyField = (&'static str, fn(&mut DutyCycleConfig) -> &mut u32);

const DUTY_FIELDS: &[DutyField] = &[
    ("duty/init_tick_period_secs", |c| &mut c.init_tick_period_secs),
    ("duty/init_tick_modulo", |c| &mut c.init_tick_modulo),
    ("duty/ready_tick_period1_secs", |c| &mut c.ready_tick_period1_secs),
    ("duty/ready_tick_period2_secs", |c| &mut c.ready_tick_period2_secs),
    ("duty/ready_tick_modulo", |c| &mut c.ready_tick_modulo),
];

/// Register every node resource and route remote writes to the controller.
pub fn bind_node_resources(
    registry: &ResourceRegistry,
    pipeline: Arc<AudioPipeline>,
    controller: ControllerHandle,
    diagnostics: Arc<Diagnostics>,
) {
    bind_audio(registry, &pipeline);
    bind_duty(registry, &controller);

    for &(name, field) in DIAG_FIELDS {
        let diagnostics = diagnostics.clone();
        registry.register(name, ReadOnly::new(move || field(&diagnostics.snapshot())));
    }

    let handle = controller.clone();
    registry.register(
        "device/mode",
        ReadOnly::new(move || {
            Value::Text(handle.mode().map_or("asleep".to_string(), |m| m.to_string()))
        }),
    );
    let handle = controller.clone();
    registry.register(
        "device/external_power",
        ReadOnly::new(move || Value::Bool(handle.external_power())),
    );
    let handle = controller.clone();
    registry.register(
        "device/wake_tick_counter",
        ReadOnly::new(move || Value::Int(handle.wake_tick_counter() as i64)),
    );

    registry.on_remote_write(move |_| controller.instruction_received());
}

fn bind_audio(registry: &ResourceRegistry, pipeline: &Arc<AudioPipeline>) {
    let (get, set) = (pipeline.clone(), pipeline.clone());
    registry.register(
        "audio/streaming_enabled",
        ReadWrite::new(
            move || Value::Bool(get.is_streaming()),
            move |value| {
                let enable = value.as_bool()?;
                set.update_pending(|c| c.streaming_enabled = enable);
                if !enable {
                    set.stop_session();
                    return Ok(());
                }
                match set.start_from_pending() {
                    Ok(()) | Err(StartError::AlreadyActive) => Ok(()),
                    Err(e) => {
                        warn!("Remote start failed: {}", e);
                        set.update_pending(|c| c.streaming_enabled = false);
                        Err(e.into())
                    }
                }
            },
        ),
    );

    let (get, set) = (pipeline.clone(), pipeline.clone());
    registry.register(
        "audio/duration_limit_secs",
        ReadWrite::new(
            move || Value::Int(get.pending_config().duration_limit_secs.unwrap_or(0) as i64),
            move |value| {
                let secs = u32::try_from(value.as_int()?).map_err(|_| ConfigError::InvalidValue {
                    field: "duration_limit_secs",
                    reason: "must be between 0 and 2^32-1",
                })?;
                set.update_pending(|c| c.duration_limit_secs = (secs > 0).then_some(secs));
                Ok(())
            },
        ),
    );

    let (get, set) = (pipeline.clone(), pipeline.clone());
    registry.register(
        "audio/gain",
        ReadWrite::new(
            move || Value::Int(get.pending_config().gain.to_remote()),
            move |value| {
                let gain = Gain::from_remote(value.as_int()?)?;
                set.update_pending(|c| c.gain = gain);
                Ok(())
            },
        ),
    );

    let (get, set) = (pipeline.clone(), pipeline.clone());
    registry.register(
        "audio/transport",
        ReadWrite::new(
            move || Value::Text(get.pending_config().transport_mode.as_str().to_string()),
            move |value| {
                let mode: TransportMode = value.as_text()?.parse()?;
                set.update_pending(|c| c.transport_mode = mode);
                Ok(())
            },
        ),
    );

    let (get, set) = (pipeline.clone(), pipeline.clone());
    registry.register(
        "audio/server_url",
        ReadWrite::new(
            move || Value::Text(get.pending_config().server_url.address()),
            move |value| {
                let url: ServerUrl = value.as_text()?.parse()?;
                set.update_pending(|c| c.server_url = url);
                Ok(())
            },
        ),
    );

    let get = pipeline.clone();
    registry.register(
        "audio/last_session_end",
        ReadOnly::new(move || {
            Value::Text(get.last_end().map_or(String::new(), |end| end.to_string()))
        }),
    );
}

fn bind_duty(registry: &ResourceRegistry, controller: &ControllerHandle) {
    for &(name, field) in DUTY_FIELDS {
        let (get, set) = (controller.clone(), controller.clone());
        registry.register(
            name,
            ReadWrite::new(
                move || Value::Int(*field(&mut get.pending_duty()) as i64),
                move |value| {
                    let raw = u32::try_from(value.as_int()?).map_err(|_| {
                        ConfigError::InvalidValue {
                            field: "duty",
                            reason: "out of range",
                        }
                    })?;
                    let mut pending = set.pending_duty();
                    *field(&mut pending) = raw;
                    set.set_pending_duty(pending)?;
                    info!("{} = {} (applies at next mode entry)", name, raw);
                    Ok(())
                },
            ),
        );
    }
}
