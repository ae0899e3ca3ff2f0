// Numan Thabit 2025
// dump.rs - per-node CSV packet dumps for debugging

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::descriptor::PacketDescriptor;

const CSV_HEADER: &str =
    "Timestamp,PacketID,EgressPort,PacketSize,Priority,DSCP,Color,VLANID,Sport,Dport";

/// Appends one CSV row per observed descriptor.
#[derive(Debug)]
pub struct PacketLogger {
    writer: BufWriter<File>,
}

impl PacketLogger {
    fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{CSV_HEADER}")?;
        writer.flush()?;
        Ok(Self { writer })
    }

    pub fn log(&mut self, desc: &PacketDescriptor) -> io::Result<()> {
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{}",
            timestamp(),
            desc.packet_id(),
            desc.egress_port(),
            desc.packet_size(),
            desc.priority(),
            desc.dscp(),
            desc.color(),
            desc.vlan_id(),
            desc.sport(),
            desc.dport(),
        )?;
        self.writer.flush()
    }
}

/// Pair of CSV dumps a node writes when the debug flag is active: one row
/// per enqueued descriptor and one per dequeued descriptor.
#[derive(Debug)]
pub struct NodeDump {
    pub input: PacketLogger,
    pub output: PacketLogger,
}

impl NodeDump {
    /// Opens `packet_log_in<id>.csv` and `packet_log_out<id>.csv` in `dir`.
    pub fn for_node(id: u32, dir: &Path) -> io::Result<Self> {
        let input = PacketLogger::create(&dump_path(dir, "in", id))?;
        let output = PacketLogger::create(&dump_path(dir, "out", id))?;
        Ok(Self { input, output })
    }
}

fn dump_path(dir: &Path, direction: &str, id: u32) -> PathBuf {
    dir.join(format!("packet_log_{direction}{id}.csv"))
}

// Wall-clock timestamp as HH:MM:SS.mmm.uuuuuu, matching the dump consumers.
fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (h, m, s) = (secs / 3600 % 24, secs / 60 % 60, secs % 60);
    let millis = now.subsec_millis();
    let micros = now.subsec_micros() % 1_000_000;
    format!("{h:02}:{m:02}:{s:02}.{millis:03}.{micros:06}")
}
