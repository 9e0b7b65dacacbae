use crate::error::Error;

#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
#[repr(u8)]
pub enum Opcode {
    StunEchoRequest = 0x01,
    StunEchoResponse = 0x02,
    StunReportRequest = 0x03,
    StunReportResponse = 0x04,

    HpRegisterRequest = 0x20,
    HpRegisterResponse = 0x21,
    HpUnregisterRequest = 0x22,
    HpUnregisterResponse = 0x23,
    HpKeepAliveRequest = 0x24,
    HpKeepAliveResponse = 0x25,
    HpConnectRequest = 0x26,
    HpConnectResponse = 0x27,
    HpPing = 0x28,
    HpPong = 0x29,
    HpDeleteConnection = 0x2a,
    HpExpire = 0x2b,

    /// Application level connection test
    ConnectionPing = 0x50,
    ConnectionPong = 0x51,

    Data = 0x60,
    Unknown = 255,
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Opcode::StunEchoRequest,
            0x02 => Opcode::StunEchoResponse,
            0x03 => Opcode::StunReportRequest,
            0x04 => Opcode::StunReportResponse,
            0x20 => Opcode::HpRegisterRequest,
            0x21 => Opcode::HpRegisterResponse,
            0x22 => Opcode::HpUnregisterRequest,
            0x23 => Opcode::HpUnregisterResponse,
            0x24 => Opcode::HpKeepAliveRequest,
            0x25 => Opcode::HpKeepAliveResponse,
            0x26 => Opcode::HpConnectRequest,
            0x27 => Opcode::HpConnectResponse,
            0x28 => Opcode::HpPing,
            0x29 => Opcode::HpPong,
            0x2a => Opcode::HpDeleteConnection,
            0x2b => Opcode::HpExpire,
            0x50 => Opcode::ConnectionPing,
            0x51 => Opcode::ConnectionPong,
            0x60 => Opcode::Data,
            _ => Opcode::Unknown,
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

impl Opcode {
    pub fn is_stun(&self) -> bool {
        (*self as u8) < 0x20
    }
    pub fn is_hole_punching(&self) -> bool {
        (0x20..0x40).contains(&(*self as u8))
    }
    pub fn is_application(&self) -> bool {
        matches!(
            self,
            Opcode::ConnectionPing | Opcode::ConnectionPong | Opcode::Data
        )
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<u8> for $name {
            type Error = Error;

            fn try_from(value: u8) -> Result<Self, Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    v => Err(Error::decode(format!("{} {}", stringify!($name), v))),
                }
            }
        }
    };
}

wire_enum! {
    /// Which reply path a STUN echo asks for.
    pub enum EchoKind {
        Plain = 0,
        /// Reply from the server's alternate port.
        ChangePort = 1,
        /// Reply from the partner server.
        ChangeServer = 2,
        /// Server to partner relay of a `ChangeServer` request.
        Forwarded = 3,
    }
}

wire_enum! {
    pub enum RegisterStatus {
        Accepted = 0,
        Rejected = 1,
    }
}

wire_enum! {
    pub enum UnregisterStatus {
        Success = 0,
        NotRegistered = 1,
        Fail = 2,
        DelayLessThanZero = 3,
        AlreadyMoving = 4,
    }
}

wire_enum! {
    pub enum KeepAliveStatus {
        Alive = 0,
        NotRegistered = 1,
    }
}

wire_enum! {
    pub enum ConnectStatus {
        Success = 0,
        UnknownTarget = 1,
    }
}
