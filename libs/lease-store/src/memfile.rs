//! Append-only CSV lease journal ("memfile").
//!
//! The first line declares the column names; newer columns are appended,
//! never reordered. Each mutation appends one row in a single write call.
//! A row with valid lifetime 0 is a tombstone. On load, rows that fail to
//! parse are logged and skipped; the journal replays last-wins per address.
//!
//! The compaction utility operates on sibling files (`.previous`, `.copy`,
//! `.output`, `.finish`) and records its pid in `.pid`; the server refuses
//! to start while that pid names a live process.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{Lease4, Lease6, LeaseState, LeaseType6};

const HEADER4: &str = "address,hwaddr,client_id,valid_lifetime,expire,subnet_id,fqdn_fwd,fqdn_rev,hostname,state,user_context";
const HEADER6: &str = "address,prefix_len,duid,iaid,lease_type,subnet_id,preferred_lifetime,valid_lifetime,expire,state";

#[derive(Debug, Error)]
pub enum MemfileError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("lease file {path} header does not declare expected columns")]
    BadHeader { path: PathBuf },
    #[error("lease-file cleanup already running (pid {pid})")]
    CleanupRunning { pid: u32 },
}

/// sibling files used by the lease-file compaction utility
#[derive(Debug, Clone)]
pub struct LfcPaths {
    base: PathBuf,
}

impl LfcPaths {
    pub fn new<P: AsRef<Path>>(lease_file: P) -> Self {
        LfcPaths {
            base: lease_file.as_ref().to_path_buf(),
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut s = self.base.as_os_str().to_owned();
        s.push(suffix);
        PathBuf::from(s)
    }

    pub fn previous(&self) -> PathBuf {
        self.sibling(".previous")
    }
    pub fn copy(&self) -> PathBuf {
        self.sibling(".copy")
    }
    pub fn output(&self) -> PathBuf {
        self.sibling(".output")
    }
    pub fn finish(&self) -> PathBuf {
        self.sibling(".finish")
    }
    pub fn pid(&self) -> PathBuf {
        self.sibling(".pid")
    }
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Refuse startup while a lease-file cleanup process is still alive. A
/// pid file naming a dead process is stale and is removed.
pub fn check_lfc_instance<P: AsRef<Path>>(lease_file: P) -> Result<(), MemfileError> {
    let pid_path = LfcPaths::new(&lease_file).pid();
    let contents = match fs::read_to_string(&pid_path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    match contents.trim().parse::<u32>() {
        Ok(pid) if pid_alive(pid) => Err(MemfileError::CleanupRunning { pid }),
        Ok(pid) => {
            debug!(pid, path = %pid_path.display(), "removing stale cleanup pid file");
            fs::remove_file(&pid_path)?;
            Ok(())
        }
        Err(_) => {
            warn!(path = %pid_path.display(), "unparseable cleanup pid file, removing");
            fs::remove_file(&pid_path)?;
            Ok(())
        }
    }
}

// CSV field escaping: commas and newlines inside free-form fields
// (hostname, user context) are entity encoded, everything else is plain
fn escape(s: &str) -> String {
    s.replace(',', "&#x2c").replace('\n', "&#xa")
}

fn unescape(s: &str) -> String {
    s.replace("&#x2c", ",").replace("&#xa", "\n")
}

fn hex_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_hex_field(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() {
        return Some(Vec::new());
    }
    s.split(':')
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect()
}

/// column positions from a header line. Columns may be appended in newer
/// files; a file missing a required column is rejected.
#[derive(Debug)]
struct Columns(BTreeMap<String, usize>);

impl Columns {
    fn parse(header: &str) -> Self {
        Columns(
            header
                .trim_end()
                .split(',')
                .enumerate()
                .map(|(i, name)| (name.to_owned(), i))
                .collect(),
        )
    }

    fn covers(&self, expected: &str) -> bool {
        expected.split(',').all(|name| self.0.contains_key(name))
    }

    fn get<'a>(&self, fields: &[&'a str], name: &str) -> Option<&'a str> {
        self.0.get(name).and_then(|&i| fields.get(i)).copied()
    }
}

fn parse_timestamp(micros: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros.parse().ok()?)
}

fn parse_row4(cols: &Columns, line: &str) -> Option<Lease4> {
    let fields: Vec<&str> = line.split(',').collect();
    let addr: Ipv4Addr = cols.get(&fields, "address")?.parse().ok()?;
    let hwaddr = parse_hex_field(cols.get(&fields, "hwaddr")?)?;
    let client_id = {
        let raw = cols.get(&fields, "client_id")?;
        if raw.is_empty() {
            None
        } else {
            Some(parse_hex_field(raw)?)
        }
    };
    let valid_lifetime: u32 = cols.get(&fields, "valid_lifetime")?.parse().ok()?;
    let expire = parse_timestamp(cols.get(&fields, "expire")?)?;
    let subnet_id = cols.get(&fields, "subnet_id")?.parse().ok()?;
    let fqdn_fwd = cols.get(&fields, "fqdn_fwd")? == "1";
    let fqdn_rev = cols.get(&fields, "fqdn_rev")? == "1";
    let hostname = unescape(cols.get(&fields, "hostname")?);
    let state = LeaseState::from_u8(cols.get(&fields, "state")?.parse().ok()?)?;
    let user_context = {
        let raw = cols.get(&fields, "user_context")?;
        if raw.is_empty() {
            None
        } else {
            serde_json::from_str(&unescape(raw)).ok()?
        }
    };
    Some(Lease4 {
        addr,
        hwaddr,
        client_id,
        subnet_id,
        valid_lifetime,
        cltt: expire - TimeDelta::seconds(i64::from(valid_lifetime)),
        state,
        hostname,
        fqdn_fwd,
        fqdn_rev,
        user_context,
    })
}

fn format_row4(lease: &Lease4, valid_lifetime: u32) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{}\n",
        lease.addr,
        hex_field(&lease.hwaddr),
        lease.client_id.as_deref().map(hex_field).unwrap_or_default(),
        valid_lifetime,
        lease.expire_time().timestamp_micros(),
        lease.subnet_id,
        u8::from(lease.fqdn_fwd),
        u8::from(lease.fqdn_rev),
        escape(&lease.hostname),
        lease.state.as_u8(),
        lease
            .user_context
            .as_ref()
            .map(|ctx| escape(&ctx.to_string()))
            .unwrap_or_default(),
    )
}

fn parse_row6(cols: &Columns, line: &str) -> Option<Lease6> {
    let fields: Vec<&str> = line.split(',').collect();
    let addr: Ipv6Addr = cols.get(&fields, "address")?.parse().ok()?;
    let prefix_len: u8 = cols.get(&fields, "prefix_len")?.parse().ok()?;
    let duid = parse_hex_field(cols.get(&fields, "duid")?)?;
    let iaid: u32 = cols.get(&fields, "iaid")?.parse().ok()?;
    let lease_type = LeaseType6::from_u8(cols.get(&fields, "lease_type")?.parse().ok()?)?;
    let subnet_id = cols.get(&fields, "subnet_id")?.parse().ok()?;
    let preferred_lifetime: u32 = cols.get(&fields, "preferred_lifetime")?.parse().ok()?;
    let valid_lifetime: u32 = cols.get(&fields, "valid_lifetime")?.parse().ok()?;
    let expire = parse_timestamp(cols.get(&fields, "expire")?)?;
    let state = LeaseState::from_u8(cols.get(&fields, "state")?.parse().ok()?)?;
    Some(Lease6 {
        addr,
        prefix_len,
        duid,
        iaid,
        lease_type,
        subnet_id,
        preferred_lifetime,
        valid_lifetime,
        cltt: expire - TimeDelta::seconds(i64::from(valid_lifetime)),
        state,
    })
}

fn format_row6(lease: &Lease6, valid_lifetime: u32) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}\n",
        lease.addr,
        lease.prefix_len,
        hex_field(&lease.duid),
        lease.iaid,
        lease.lease_type.as_u8(),
        lease.subnet_id,
        lease.preferred_lifetime,
        valid_lifetime,
        lease.expire_time().timestamp_micros(),
        lease.state.as_u8(),
    )
}

fn open_journal(path: &Path, header: &str) -> Result<(File, Option<BufReader<File>>), MemfileError> {
    let existing = match File::open(path) {
        Ok(file) => Some(BufReader::new(file)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return Err(err.into()),
    };
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if existing.is_none() || file.metadata()?.len() == 0 {
        file.write_all(format!("{header}\n").as_bytes())?;
        file.flush()?;
        return Ok((file, None));
    }
    Ok((file, existing))
}

/// the v4 lease journal
#[derive(Debug)]
pub struct LeaseFile4 {
    file: File,
    path: PathBuf,
}

impl LeaseFile4 {
    /// open (creating if needed) and replay the journal into its final
    /// lease set
    pub fn open(path: &Path) -> Result<(Self, Vec<Lease4>), MemfileError> {
        check_lfc_instance(path)?;
        let (file, reader) = open_journal(path, HEADER4)?;
        let mut leases = BTreeMap::new();
        if let Some(reader) = reader {
            let mut lines = reader.lines();
            let header = lines.next().transpose()?.unwrap_or_default();
            let cols = Columns::parse(&header);
            if !cols.covers(HEADER4) {
                return Err(MemfileError::BadHeader {
                    path: path.to_path_buf(),
                });
            }
            for (lineno, line) in lines.enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match parse_row4(&cols, &line) {
                    Some(lease) if lease.valid_lifetime == 0 => {
                        leases.remove(&lease.addr);
                    }
                    Some(lease) => {
                        leases.insert(lease.addr, lease);
                    }
                    None => {
                        // a bad row never halts the load
                        warn!(path = %path.display(), line = lineno + 2, "skipping unparseable lease row");
                    }
                }
            }
        }
        Ok((
            LeaseFile4 {
                file,
                path: path.to_path_buf(),
            },
            leases.into_values().collect(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// append one lease row. The row is formatted up front and written
    /// with a single call so concurrent readers never see a torn row.
    pub fn append(&mut self, lease: &Lease4) -> Result<(), MemfileError> {
        self.file
            .write_all(format_row4(lease, lease.valid_lifetime).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    /// append a tombstone for a removed lease
    pub fn append_delete(&mut self, lease: &Lease4) -> Result<(), MemfileError> {
        self.file.write_all(format_row4(lease, 0).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// the v6 lease journal
#[derive(Debug)]
pub struct LeaseFile6 {
    file: File,
    path: PathBuf,
}

impl LeaseFile6 {
    pub fn open(path: &Path) -> Result<(Self, Vec<Lease6>), MemfileError> {
        check_lfc_instance(path)?;
        let (file, reader) = open_journal(path, HEADER6)?;
        let mut leases = BTreeMap::new();
        if let Some(reader) = reader {
            let mut lines = reader.lines();
            let header = lines.next().transpose()?.unwrap_or_default();
            let cols = Columns::parse(&header);
            if !cols.covers(HEADER6) {
                return Err(MemfileError::BadHeader {
                    path: path.to_path_buf(),
                });
            }
            for (lineno, line) in lines.enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match parse_row6(&cols, &line) {
                    Some(lease) if lease.valid_lifetime == 0 => {
                        leases.remove(&(lease.lease_type, lease.addr));
                    }
                    Some(lease) => {
                        leases.insert((lease.lease_type, lease.addr), lease);
                    }
                    None => {
                        warn!(path = %path.display(), line = lineno + 2, "skipping unparseable lease row");
                    }
                }
            }
        }
        Ok((
            LeaseFile6 {
                file,
                path: path.to_path_buf(),
            },
            leases.into_values().collect(),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, lease: &Lease6) -> Result<(), MemfileError> {
        self.file
            .write_all(format_row6(lease, lease.valid_lifetime).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn append_delete(&mut self, lease: &Lease6) -> Result<(), MemfileError> {
        self.file.write_all(format_row6(lease, 0).as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    fn lease(addr: [u8; 4]) -> Lease4 {
        // journal timestamps carry microsecond resolution
        let cltt = Utc::now().trunc_subsecs(6);
        let mut l = Lease4::new(addr.into(), &[0xaa, 0xbb, 0xcc, 0, 0, 1], Some(&[1, 2, 3]), 1, 4000, cltt);
        l.hostname = "host,with,commas".into();
        l.user_context = Some(serde_json::json!({"rack": "r1"}));
        l
    }

    #[test]
    fn journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases4.csv");
        {
            let (mut file, loaded) = LeaseFile4::open(&path).unwrap();
            assert!(loaded.is_empty());
            file.append(&lease([192, 0, 2, 100])).unwrap();
            file.append(&lease([192, 0, 2, 101])).unwrap();
        }
        let (_, loaded) = LeaseFile4::open(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].hostname, "host,with,commas");
        assert_eq!(loaded[0].user_context, Some(serde_json::json!({"rack": "r1"})));
    }

    #[test]
    fn journal_replays_last_wins_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases4.csv");
        {
            let (mut file, _) = LeaseFile4::open(&path).unwrap();
            let mut l = lease([192, 0, 2, 100]);
            file.append(&l).unwrap();
            l.hostname = "renamed".into();
            file.append(&l).unwrap();
            file.append(&lease([192, 0, 2, 101])).unwrap();
            file.append_delete(&lease([192, 0, 2, 101])).unwrap();
        }
        let (_, loaded) = LeaseFile4::open(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hostname, "renamed");
    }

    #[test]
    fn bad_rows_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases4.csv");
        {
            let (mut file, _) = LeaseFile4::open(&path).unwrap();
            file.append(&lease([192, 0, 2, 100])).unwrap();
        }
        // corrupt the file with a garbage row
        let mut contents = fs::read_to_string(&path).unwrap();
        contents.push_str("not,a,lease\n");
        fs::write(&path, contents).unwrap();

        let (_, loaded) = LeaseFile4::open(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn newer_files_may_append_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases4.csv");
        let row = format_row4(&lease([192, 0, 2, 100]), 4000);
        fs::write(
            &path,
            format!("{HEADER4},pool_id\n{},0\n", row.trim_end()),
        )
        .unwrap();
        let (_, loaded) = LeaseFile4::open(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn live_cleanup_pid_blocks_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases4.csv");
        let pid_path = LfcPaths::new(&path).pid();
        // our own pid is certainly alive
        fs::write(&pid_path, format!("{}", std::process::id())).unwrap();
        assert!(matches!(
            LeaseFile4::open(&path),
            Err(MemfileError::CleanupRunning { .. })
        ));

        // a stale pid is cleaned up and startup proceeds
        fs::write(&pid_path, "999999999").unwrap();
        assert!(LeaseFile4::open(&path).is_ok());
        assert!(!pid_path.exists());
    }

    #[test]
    fn v6_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases6.csv");
        let cltt = Utc::now().trunc_subsecs(6);
        {
            let (mut file, _) = LeaseFile6::open(&path).unwrap();
            let mut l = Lease6::new_addr(
                "2001:db8::100".parse().unwrap(),
                &[0, 3, 0, 1, 1, 2, 3, 4, 5, 6],
                42,
                7,
                3000,
                4000,
                cltt,
            );
            file.append(&l).unwrap();
            l.lease_type = LeaseType6::IaPd;
            l.prefix_len = 56;
            l.addr = "2001:db8:100::".parse().unwrap();
            file.append(&l).unwrap();
        }
        let (_, loaded) = LeaseFile6::open(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|l| l.lease_type == LeaseType6::IaPd && l.prefix_len == 56));
    }
}
