use serde::Serialize;

/// Session pack sizes sold by the school. Anything else is rejected both at
/// the IPC boundary and by the bulk importer.
pub const PACK_SIZES: [i64; 4] = [4, 10, 20, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Subject {
    Piano,
    Guitar,
    Drums,
    Violin,
    Vocal,
    Keyboard,
    Flute,
}

impl Subject {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "piano" => Some(Self::Piano),
            "guitar" => Some(Self::Guitar),
            "drums" => Some(Self::Drums),
            "violin" => Some(Self::Violin),
            "vocal" | "vocals" => Some(Self::Vocal),
            "keyboard" => Some(Self::Keyboard),
            "flute" => Some(Self::Flute),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Piano => "Piano",
            Self::Guitar => "Guitar",
            Self::Drums => "Drums",
            Self::Violin => "Violin",
            Self::Vocal => "Vocal",
            Self::Keyboard => "Keyboard",
            Self::Flute => "Flute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionType {
    Solo,
    Duo,
    Focus,
}

impl SessionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "solo" => Some(Self::Solo),
            "duo" => Some(Self::Duo),
            "focus" => Some(Self::Focus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solo => "Solo",
            Self::Duo => "Duo",
            Self::Focus => "Focus",
        }
    }
}

/// Hard cap on Duo participation.
pub const DUO_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Location {
    Online,
    Offline,
}

impl Location {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }
}

/// Session lifecycle/attendance status. Transitions are deliberately not
/// validated as a state machine; any known status may be stamped over any
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Scheduled,
    Present,
    Absent,
    CancelledByStudent,
    CancelledByTeacher,
    CancelledBySchool,
    NoShow,
}

impl SessionStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(Self::Scheduled),
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            "cancelled by student" => Some(Self::CancelledByStudent),
            "cancelled by teacher" => Some(Self::CancelledByTeacher),
            "cancelled by school" => Some(Self::CancelledBySchool),
            "no show" => Some(Self::NoShow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Present => "Present",
            Self::Absent => "Absent",
            Self::CancelledByStudent => "Cancelled by Student",
            Self::CancelledByTeacher => "Cancelled by Teacher",
            Self::CancelledBySchool => "Cancelled by School",
            Self::NoShow => "No Show",
        }
    }

    /// Scheduled and Present rows occupy their time slot; cancelled and
    /// no-show rows do not.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Present)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::CancelledByStudent | Self::CancelledByTeacher | Self::CancelledBySchool
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaymentMode {
    Cash,
    Card,
    BankTransfer,
    Upi,
    Other,
}

impl PaymentMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "card" => Some(Self::Card),
            "bank transfer" | "bank_transfer" => Some(Self::BankTransfer),
            "upi" => Some(Self::Upi),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "Cash",
            Self::Card => "Card",
            Self::BankTransfer => "Bank Transfer",
            Self::Upi => "UPI",
            Self::Other => "Other",
        }
    }
}
