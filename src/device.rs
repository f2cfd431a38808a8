//! Device orchestrator: glues transport, channel, codec, and state store
//! together behind `send`/`wait_for` (spec.md §4.E).
//!
//! Built with [`Device::new`], which owns construction of the underlying
//! [`Channel`] plus the same self-referential wiring problem
//! [`Channel::new`] already solves one layer down: the channel needs its
//! [`ChannelListener`] before the device exists. Resolved with the same
//! weak-relay shape (see [`crate::channel`]'s doc comment).

use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::channel::{Channel, ChannelListener, SendStatus};
use crate::codec::{Codec, CodecError, Value};
use crate::schema::{BufferKind, Catalogue, ListKind};
use crate::state::{Slot, Store};
use crate::wire::DataType;

/// Default number of *additional* attempts after the first send, per
/// spec.md §4.E ("default `retries = 5`").
pub const DEFAULT_RETRIES: u32 = 5;
/// Default per-try ack wait, per spec.md §4.E ("`timeout = 0.15 s`").
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(150);

/// The three outbound buffer ids plus the set of inbound command buffers
/// a product declares, per spec.md §6's per-product table.
#[derive(Debug, Clone)]
pub struct BufferPlan {
    pub nack: u8,
    pub ack: u8,
    pub urgent: Option<u8>,
    pub command: Vec<u8>,
}

impl BufferPlan {
    /// Bebop family: ackBuffer=11, nackBuffer=10, urgBuffer=12, recv={126,127}.
    pub fn bebop() -> Self {
        Self {
            nack: 10,
            ack: 11,
            urgent: Some(12),
            command: vec![126, 127],
        }
    }

    /// Jumping family: ackBuffer=11, nackBuffer=10, recv={126,127}, no urgent buffer.
    pub fn jumping_sumo() -> Self {
        Self {
            nack: 10,
            ack: 11,
            urgent: None,
            command: vec![126, 127],
        }
    }

    /// Same numbering as Bebop; bring-up uses the `skyctrl.*` project names.
    pub fn sky_controller() -> Self {
        Self::bebop()
    }

    /// Mambo has no urgent buffer either, same as the Jumping family.
    pub fn mambo() -> Self {
        Self::jumping_sumo()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("no {kind:?} buffer configured for this product")]
    NoBufferForKind { kind: BufferKind },
    #[error("malformed command name {0:?}, expected \"project.class.command\"")]
    MalformedName(String),
}

/// Forwards channel events into a [`Device`] that does not exist yet at
/// the time [`Channel::new`] is called.
struct Relay(Mutex<Option<Weak<Device>>>);

impl ChannelListener for Relay {
    fn on_data(&self, buffer: u8, payload: &[u8]) {
        if let Some(device) = self.0.lock().as_ref().and_then(Weak::upgrade) {
            device.on_data(buffer, payload);
        }
    }

    fn on_disconnect(&self) {
        if let Some(device) = self.0.lock().as_ref().and_then(Weak::upgrade) {
            device.on_disconnect();
        }
    }
}

/// Owns a [`Channel`] and a [`Store`]; the single entry point application
/// code talks to (spec.md §4.E).
pub struct Device {
    channel: Arc<Channel>,
    store: Arc<Store>,
    codec: Codec,
    plan: BufferPlan,
    retries: u32,
    timeout: Duration,
}

impl Device {
    /// Opens the channel to `ip:remote_port`/`local_port` for `plan` and
    /// binds `catalogue` for command encode/decode. Uses the documented
    /// defaults for `retries`/`timeout` (spec.md §4.E); use
    /// [`Device::with_retry_policy`] to override them.
    pub fn new(
        ip: IpAddr,
        remote_port: u16,
        local_port: u16,
        plan: BufferPlan,
        catalogue: Arc<Catalogue>,
    ) -> std::io::Result<Arc<Self>> {
        Self::with_retry_policy(
            ip,
            remote_port,
            local_port,
            plan,
            catalogue,
            DEFAULT_RETRIES,
            DEFAULT_TIMEOUT,
        )
    }

    pub fn with_retry_policy(
        ip: IpAddr,
        remote_port: u16,
        local_port: u16,
        plan: BufferPlan,
        catalogue: Arc<Catalogue>,
        retries: u32,
        timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let relay = Arc::new(Relay(Mutex::new(None)));

        let mut send_buffers = vec![plan.nack, plan.ack];
        if let Some(urgent) = plan.urgent {
            send_buffers.push(urgent);
        }

        let channel = Channel::new(
            ip,
            remote_port,
            local_port,
            &send_buffers,
            &plan.command,
            relay.clone(),
        )?;

        let device = Arc::new(Self {
            channel,
            store: Arc::new(Store::new()),
            codec: Codec::new(catalogue),
            plan,
            retries,
            timeout,
        });

        *relay.0.lock() = Some(Arc::downgrade(&device));

        Ok(device)
    }

    /// Encodes `name` (`"project.class.command"`, class empty for a
    /// feature) against `args`, maps the schema's recommended buffer
    /// kind to a buffer id and data type, and sends it with
    /// `tries = retries + 1`.
    pub fn send(&self, name: &str, args: &[Value]) -> Result<SendStatus, DeviceError> {
        let (project, class, command) = split_name(name)?;

        let (bytes, buffer_kind, _timeout_policy) =
            self.codec.encode(project, class, command, args)?;

        let buffer = match buffer_kind {
            BufferKind::NonAck => self.plan.nack,
            BufferKind::Ack => self.plan.ack,
            BufferKind::HighPrio => self
                .plan
                .urgent
                .ok_or(DeviceError::NoBufferForKind { kind: buffer_kind })?,
        };

        let data_type = match buffer_kind {
            BufferKind::NonAck => DataType::Data,
            BufferKind::Ack => DataType::DataWithAck,
            BufferKind::HighPrio => DataType::DataLowLatency,
        };

        Ok(self
            .channel
            .send(buffer, &bytes, data_type, self.timeout, self.retries + 1))
    }

    /// Blocks until `name` (store key, `"project.class.command"`) is
    /// signalled changed, or `timeout` elapses.
    pub fn wait_for(&self, name: &str, timeout: Option<Duration>) -> bool {
        self.store.wait_for(name, timeout)
    }

    /// Deep copy of the current value of `name`, if ever received.
    pub fn get(&self, name: &str) -> Option<Slot> {
        self.store.get(name)
    }

    pub fn stop(&self) {
        self.channel.stop();
    }

    /// The [`ChannelListener::on_data`] implementation: only decodes and
    /// routes frames arriving on a declared command buffer.
    fn on_data(&self, buffer: u8, payload: &[u8]) {
        if !self.plan.command.contains(&buffer) {
            return;
        }

        let (decoded, known) = match self.codec.decode(payload) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, %buffer, "dropping malformed command frame");
                return;
            }
        };

        if !known {
            tracing::trace!(%buffer, "dropping unrecognised command");
            return;
        }

        match decoded.list_kind {
            Some(ListKind::None) | None => {
                self.store
                    .put(&decoded.project, &decoded.class, &decoded.command, decoded.args);
            }
            Some(ListKind::List) => {
                self.store.put_list(
                    &decoded.project,
                    &decoded.class,
                    &decoded.command,
                    decoded.args,
                );
            }
            Some(ListKind::Map) => {
                let key = decoded
                    .arg0
                    .clone()
                    .unwrap_or_else(|| Value::String("no_arg".to_owned()));
                self.store.put_map(
                    &decoded.project,
                    &decoded.class,
                    &decoded.command,
                    decoded.args,
                    key,
                );
            }
        }
    }

    fn on_disconnect(&self) {
        self.channel.stop();
    }

    /// Common bring-up profile: date/time, then settings and states,
    /// each awaited up to 5 seconds (spec.md §4.E).
    pub fn bring_up_common(&self) -> Result<(), DeviceError> {
        self.send("common.Common.CurrentDate", &[current_date_arg()])?;
        self.send("common.Common.CurrentTime", &[current_time_arg()])?;

        self.send("common.Settings.AllSettings", &[])?;
        self.wait_for(
            "common.SettingsState.AllSettingsChanged",
            Some(Duration::from_secs(5)),
        );

        self.send("common.Common.AllStates", &[])?;
        self.wait_for(
            "common.CommonState.AllStatesChanged",
            Some(Duration::from_secs(5)),
        );

        Ok(())
    }

    /// SkyController bring-up: same shape as [`Device::bring_up_common`]
    /// using the `skyctrl.*` project, skipping date/time (spec.md §4.E).
    pub fn bring_up_skyctrl(&self) -> Result<(), DeviceError> {
        self.send("skyctrl.Settings.AllSettings", &[])?;
        self.wait_for(
            "skyctrl.SettingsState.AllSettingsChanged",
            Some(Duration::from_secs(5)),
        );

        self.send("skyctrl.Common.AllStates", &[])?;
        self.wait_for(
            "skyctrl.CommonState.AllStatesChanged",
            Some(Duration::from_secs(5)),
        );

        Ok(())
    }
}

/// Splits a `"project.class.command"` name, tolerating an empty class
/// segment for features (`"battery..Level"`), matching
/// [`crate::state::Store`]'s key convention exactly.
fn split_name(name: &str) -> Result<(&str, &str, &str), DeviceError> {
    let mut parts = name.splitn(3, '.');
    let project = parts.next().ok_or_else(|| DeviceError::MalformedName(name.to_owned()))?;
    let class = parts.next().ok_or_else(|| DeviceError::MalformedName(name.to_owned()))?;
    let command = parts.next().ok_or_else(|| DeviceError::MalformedName(name.to_owned()))?;
    Ok((project, class, command))
}

fn current_date_arg() -> Value {
    let format = format_description!("[year]-[month]-[day]");
    let now = OffsetDateTime::now_utc();
    Value::String(now.format(&format).unwrap_or_default())
}

fn current_time_arg() -> Value {
    let format = format_description!("T[hour repr:24][minute][second]+0000");
    let now = OffsetDateTime::now_utc();
    Value::String(now.format(&format).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_plans_match_spec_table() {
        let bebop = BufferPlan::bebop();
        assert_eq!((bebop.nack, bebop.ack, bebop.urgent), (10, 11, Some(12)));
        assert_eq!(bebop.command, vec![126, 127]);

        let js = BufferPlan::jumping_sumo();
        assert_eq!((js.nack, js.ack, js.urgent), (10, 11, None));

        let sky = BufferPlan::sky_controller();
        assert_eq!((sky.nack, sky.ack, sky.urgent), (10, 11, Some(12)));

        let mambo = BufferPlan::mambo();
        assert_eq!((mambo.nack, mambo.ack, mambo.urgent), (10, 11, None));
    }

    #[test]
    fn split_name_tolerates_empty_class_for_features() {
        assert_eq!(
            split_name("battery..Level").unwrap(),
            ("battery", "", "Level")
        );
        assert_eq!(
            split_name("common.Common.CurrentDate").unwrap(),
            ("common", "Common", "CurrentDate")
        );
    }

    #[test]
    fn split_name_rejects_too_few_segments() {
        assert!(matches!(split_name("common"), Err(DeviceError::MalformedName(_))));
        assert!(matches!(
            split_name("common.Common"),
            Err(DeviceError::MalformedName(_))
        ));
    }

    #[test]
    fn no_buffer_for_high_prio_on_jumping_sumo_plan() {
        // Exercises the mapping logic directly without opening a socket:
        // a plan with no urgent buffer must reject a HighPrio send.
        let plan = BufferPlan::jumping_sumo();
        let buffer = match BufferKind::HighPrio {
            BufferKind::NonAck => Some(plan.nack),
            BufferKind::Ack => Some(plan.ack),
            BufferKind::HighPrio => plan.urgent,
        };
        assert_eq!(buffer, None);
    }
}
