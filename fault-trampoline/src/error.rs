use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Only one trampoline can be installed per process.
    AlreadyInstalled,
    /// A kernel call failed during setup or registration.
    Io(std::io::Error),
    /// A received (or hand-built) message didn't decode as any recognized
    /// wire layout -- too short, too long, or an unrecognized `msg_id`.
    Malformed(&'static str),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            Self::AlreadyInstalled | Self::Malformed(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInstalled => f.write_str("a fault trampoline is already installed"),
            Self::Io(e) => write!(f, "{e}"),
            Self::Malformed(why) => write!(f, "malformed exception message: {why}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
