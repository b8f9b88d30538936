use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

/// Kind of object a file descriptor refers to, as a single non-zero bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdMode(u32);

impl FdMode {
    pub const ERROR: FdMode = FdMode(1 << 0);
    pub const FILE: FdMode = FdMode(1 << 1);
    pub const DIR: FdMode = FdMode(1 << 2);
    pub const CHAR: FdMode = FdMode(1 << 3);
    pub const BLOCK: FdMode = FdMode(1 << 4);
    pub const FIFO: FdMode = FdMode(1 << 5);
    pub const SOCKET: FdMode = FdMode(1 << 6);
    pub const UNKNOWN: FdMode = FdMode(1 << 7);

    const ALL: [FdMode; 8] = [
        FdMode::ERROR,
        FdMode::FILE,
        FdMode::DIR,
        FdMode::CHAR,
        FdMode::BLOCK,
        FdMode::FIFO,
        FdMode::SOCKET,
        FdMode::UNKNOWN,
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Option<FdMode> {
        FdMode::ALL.into_iter().find(|m| m.0 == bits)
    }

    pub fn name(self) -> &'static str {
        match self {
            FdMode::ERROR => "error",
            FdMode::FILE => "file",
            FdMode::DIR => "dir",
            FdMode::CHAR => "char",
            FdMode::BLOCK => "block",
            FdMode::FIFO => "fifo",
            FdMode::SOCKET => "socket",
            _ => "unknown",
        }
    }
}

impl fmt::Display for FdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct FdModeParseError {
    value: String,
}

impl fmt::Display for FdModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid fd mode {:?} (expected one of: error, file, dir, char, block, fifo, socket, unknown)",
            self.value
        )
    }
}

impl std::error::Error for FdModeParseError {}

impl FromStr for FdMode {
    type Err = FdModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        FdMode::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or(FdModeParseError { value: s })
    }
}

/// Classifies what a descriptor of the calling task refers to.
pub trait FdModeClassifier {
    fn classify(&self, fd: i32) -> FdMode;
}

/// Classifies descriptors with `fstat(2)`.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FstatClassifier;

#[cfg(unix)]
impl FdModeClassifier for FstatClassifier {
    fn classify(&self, fd: i32) -> FdMode {
        // SAFETY: `stat` is plain old data, so the all-zero value is valid.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: `st` is a live, exclusively borrowed `stat`; fstat only writes into
        // it and reports a bad descriptor through its return value.
        let rc = unsafe { libc::fstat(fd, &mut st) };
        if rc != 0 {
            return FdMode::ERROR;
        }
        match st.st_mode & libc::S_IFMT {
            libc::S_IFREG => FdMode::FILE,
            libc::S_IFDIR => FdMode::DIR,
            libc::S_IFCHR => FdMode::CHAR,
            libc::S_IFBLK => FdMode::BLOCK,
            libc::S_IFIFO => FdMode::FIFO,
            libc::S_IFSOCK => FdMode::SOCKET,
            _ => FdMode::UNKNOWN,
        }
    }
}

/// Returns the same mode for every descriptor and counts how often it was asked.
#[derive(Debug, Default)]
pub struct FixedClassifier {
    mode: Option<FdMode>,
    calls: Cell<usize>,
}

impl FixedClassifier {
    pub fn new(mode: FdMode) -> Self {
        FixedClassifier {
            mode: Some(mode),
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl FdModeClassifier for FixedClassifier {
    fn classify(&self, _fd: i32) -> FdMode {
        self.calls.set(self.calls.get() + 1);
        self.mode.unwrap_or(FdMode::UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_distinct_and_non_zero() {
        for (i, a) in FdMode::ALL.iter().enumerate() {
            assert_ne!(a.bits(), 0);
            assert_eq!(a.bits().count_ones(), 1);
            for b in &FdMode::ALL[i + 1..] {
                assert_ne!(a.bits(), b.bits());
            }
            assert_eq!(FdMode::from_bits(a.bits()), Some(*a));
        }
        assert_eq!(FdMode::from_bits(0), None);
    }

    #[test]
    fn parse_names() {
        for m in FdMode::ALL {
            assert_eq!(FdMode::from_str(m.name()).unwrap(), m);
        }
        assert_eq!(FdMode::from_str(" FIFO ").unwrap(), FdMode::FIFO);
        assert!(FdMode::from_str("pipe").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn fstat_classifies_open_descriptors() {
        use std::os::unix::io::AsRawFd as _;

        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        assert_eq!(FstatClassifier.classify(file.as_raw_fd()), FdMode::FILE);

        let dir = std::fs::File::open(std::env::temp_dir()).unwrap();
        assert_eq!(FstatClassifier.classify(dir.as_raw_fd()), FdMode::DIR);

        assert_eq!(FstatClassifier.classify(-1), FdMode::ERROR);
    }

    #[test]
    fn fixed_classifier_counts_calls() {
        let c = FixedClassifier::new(FdMode::CHAR);
        assert_eq!(c.classify(0), FdMode::CHAR);
        assert_eq!(c.classify(0), FdMode::CHAR);
        assert_eq!(c.calls(), 2);
    }
}
