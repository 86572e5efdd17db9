use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};
use ts::{PACKET_SIZE, SYNC_BYTE, TsPacket, find_sync_byte};

use super::bitrate_option;
use crate::plugin::{InputAborter, InputPlugin, Plugin, PluginError, PluginOptions};
use crate::{BitRate, PacketMetadata, StageContext};

const READ_BUFFER_SIZE: usize = 1024 * PACKET_SIZE;
/// Chunks read ahead by the reader thread.
const READ_AHEAD_CHUNKS: usize = 4;

/// Reads packets from a file or standard input.
///
/// Bytes before a sync byte are skipped, so a stream that starts or resumes
/// mid-packet is realigned on the next `0x47`.
///
/// The file is read on a dedicated thread so that a pipeline abort can
/// interrupt a receive blocked on a pipe or terminal.
pub struct FileInput {
    path: String,
    bitrate: BitRate,
    reader: Option<ChunkReader>,
    abort: (Sender<()>, Receiver<()>),
    skipped_bytes: u64,
}

impl FileInput {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bitrate: BitRate::UNKNOWN,
            reader: None,
            abort: crossbeam_channel::bounded(1),
            skipped_bytes: 0,
        }
    }

    pub fn from_options(options: &PluginOptions) -> Result<Self, PluginError> {
        options.expect_only(&["path", "bitrate"])?;
        let mut input = Self::new(options.get("path").unwrap_or("-"));
        input.bitrate = bitrate_option(options)?;
        Ok(input)
    }

    fn is_stdin(&self) -> bool {
        self.path == "-"
    }

    /// Read one aligned packet. `Ok(false)` at end of file.
    fn read_packet(&mut self, packet: &mut TsPacket) -> io::Result<bool> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| io::Error::other("input not started"))?;
        let bytes = packet.as_bytes_mut();

        let mut filled = read_full(reader, bytes)?;
        loop {
            if filled < PACKET_SIZE {
                if filled > 0 {
                    warn!(path = %self.path, bytes = filled, "truncated packet at end of input");
                }
                return Ok(false);
            }
            if bytes[0] == SYNC_BYTE {
                return Ok(true);
            }

            // Lost sync: keep whatever follows the next sync byte.
            let skip = find_sync_byte(&bytes[1..]).map_or(PACKET_SIZE, |offset| offset + 1);
            self.skipped_bytes += skip as u64;
            bytes.copy_within(skip.., 0);
            let kept = PACKET_SIZE - skip;
            filled = kept + read_full(reader, &mut bytes[kept..])?;
        }
    }
}

/// Move `source` onto a reader thread that forwards chunks until end of file,
/// a read error, or the receiving side goes away.
fn spawn_reader(
    source: Box<dyn Read + Send>,
) -> io::Result<Receiver<io::Result<Vec<u8>>>> {
    let (tx, rx) = crossbeam_channel::bounded(READ_AHEAD_CHUNKS);
    thread::Builder::new()
        .name("tsp-file-reader".into())
        .spawn(move || {
            let mut source = source;
            loop {
                let mut chunk = vec![0; READ_BUFFER_SIZE];
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        chunk.truncate(n);
                        if tx.send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// `Read` over the chunks of a reader thread. Once aborted, every read fails.
struct ChunkReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    abort: Receiver<()>,
    current: Vec<u8>,
    pos: usize,
    aborted: bool,
}

impl ChunkReader {
    fn new(chunks: Receiver<io::Result<Vec<u8>>>, abort: Receiver<()>) -> Self {
        Self {
            chunks,
            abort,
            current: Vec::new(),
            pos: 0,
            aborted: false,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Not `Interrupted`: `read_full` would retry it.
        let aborted = || io::Error::other("input aborted");
        while self.pos == self.current.len() {
            if self.aborted {
                return Err(aborted());
            }
            crossbeam_channel::select! {
                recv(self.chunks) -> msg => match msg {
                    Ok(Ok(chunk)) => {
                        self.current = chunk;
                        self.pos = 0;
                    }
                    Ok(Err(e)) => return Err(e),
                    // Reader thread finished.
                    Err(_) => return Ok(0),
                },
                recv(self.abort) -> _ => {
                    self.aborted = true;
                }
            }
        }
        if self.aborted {
            return Err(aborted());
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Fill `buf` as far as possible; a short count means end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Plugin for FileInput {
    fn name(&self) -> &'static str {
        "file"
    }

    fn start(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        let source: Box<dyn Read + Send> = if self.is_stdin() {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(&self.path)?)
        };
        let chunks = spawn_reader(source)?;
        self.reader = Some(ChunkReader::new(chunks, self.abort.1.clone()));
        self.skipped_bytes = 0;
        debug!(stage = ctx.index(), path = %self.path, "input opened");
        Ok(())
    }

    fn stop(&mut self, ctx: &StageContext) -> Result<(), PluginError> {
        self.reader = None;
        if self.skipped_bytes > 0 {
            info!(
                stage = ctx.index(),
                path = %self.path,
                skipped_bytes = self.skipped_bytes,
                "bytes skipped to resynchronize"
            );
        }
        Ok(())
    }
}

impl InputPlugin for FileInput {
    fn receive(
        &mut self,
        _ctx: &StageContext,
        packets: &mut [TsPacket],
        _metadata: &mut [PacketMetadata],
    ) -> Result<usize, PluginError> {
        let mut count = 0;
        for packet in packets.iter_mut() {
            if !self.read_packet(packet)? {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn bitrate(&self) -> BitRate {
        self.bitrate
    }

    fn input_aborter(&self) -> Option<InputAborter> {
        let abort = self.abort.0.clone();
        Some(Arc::new(move || {
            let _ = abort.try_send(());
        }))
    }
}
