use std::fs::File;
use std::io::{self, BufWriter, Write};

use tracing::debug;
use ts::{PACKET_SIZE, TsPacket};

use crate::plugin::{OutputPlugin, Plugin, PluginError, PluginOptions};
use crate::{PacketMetadata, StageContext};

const WRITE_BUFFER_SIZE: usize = 1024 * PACKET_SIZE;

/// Writes packets to a file or standard output.
pub struct FileOutput {
    path: String,
    writer: Option<BufWriter<Box<dyn Write + Send>>>,
    written: u64,
}

impl FileOutput {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            written: 0,
        }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["path"])?;
        Ok(Self::new(options.get("path").unwrap_or("-")))
    }
}

impl Plugin for FileOutput {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        let sink: Box<dyn Write + Send> = if self.path == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(&self.path)?)
        };
        self.writer = Some(BufWriter::with_capacity(WRITE_BUFFER_SIZE, sink));
        self.written = 0;
        debug!(stage = ctx.index(), path = %self.path, "output opened");
        Ok(())
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        debug!(
            stage = ctx.index(),
            path = %self.path,
            packets = self.written,
            "output closed"
        );
        Ok(())
    }
}

impl OutputPlugin for FileOutput {
    fn send(
        &mut self,
        _ctx: &StageContext,
        packets: &[TsPacket],
        _metadata: &[PacketMetadata],
    ) -> Result<(), PluginError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("output not started"))?;
        for packet in packets {
            writer.write_all(packet.as_bytes())?;
        }
        self.written += packets.len() as u64;
        Ok(())
    }
}
