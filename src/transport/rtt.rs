//! RTT-over-JTAG/SWD adapter. Commonly used when the target exposes its
//! console through an RTT control block instead of a UART.
use crate::record::TraceSource;
use crate::transport::{ReadStatus, Transport, TransportError};

use probe_rs::{Probe, Session};
use probe_rs_rtt::{DownChannel, Rtt, UpChannel};
use serde::{Deserialize, Serialize};

fn default_rtt_channel() -> usize {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RttConfig {
    /// Chip name as understood by the probe target registry.
    pub target: String,
    #[serde(default)]
    pub speed_khz: Option<u32>,
    #[serde(default = "default_rtt_channel")]
    pub rtt_channel: usize,
}

pub struct RttTransport {
    session: Option<Session>,
    up: UpChannel,
    down: Option<DownChannel>,
    target_name: String,
    channel: usize,
}

impl RttTransport {
    /// Attaches to the first available debug probe and the configured
    /// RTT channel pair.
    pub fn open(config: &RttConfig) -> Result<Self, TransportError> {
        let probes = Probe::list_all();
        let probe_info = probes
            .first()
            .ok_or_else(|| TransportError::Open("no debug probe found".to_string()))?;
        let mut probe = probe_info.open()?;
        if let Some(speed_khz) = config.speed_khz {
            probe.set_speed(speed_khz)?;
        }
        let mut session = probe.attach(config.target.as_str())?;

        let memory_map = session.target().memory_map.clone();
        let (up, down) = {
            let mut core = session.core(0)?;
            let mut rtt = Rtt::attach(&mut core, &memory_map)?;
            let up = rtt.up_channels().take(config.rtt_channel).ok_or_else(|| {
                TransportError::Open(format!("RTT up channel {} not present", config.rtt_channel))
            })?;
            let down = rtt.down_channels().take(config.rtt_channel);
            (up, down)
        };

        Ok(Self {
            session: Some(session),
            up,
            down,
            target_name: config.target.clone(),
            channel: config.rtt_channel,
        })
    }
}

impl Transport for RttTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, TransportError> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(ReadStatus::Closed),
        };
        let mut core = session.core(0)?;
        match self.up.read(&mut core, buf)? {
            0 => Ok(ReadStatus::TimedOut),
            n => Ok(ReadStatus::Data(n)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        let down = self
            .down
            .as_mut()
            .ok_or(TransportError::Unsupported("RTT target has no down channel"))?;
        let mut core = session.core(0)?;
        let mut written = 0;
        while written < bytes.len() {
            written += down.write(&mut core, &bytes[written..])?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.session = None;
    }

    fn source(&self) -> TraceSource {
        TraceSource::Rtt
    }

    fn describe(&self) -> String {
        format!("RTT channel {} (attached to {})", self.channel, self.target_name)
    }
}
