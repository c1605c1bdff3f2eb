use core::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("invalid decimal number: {0}")]
    Decimal(String),
}

fn decode_hex(s: &str) -> Result<Vec<u8>, ParseError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(hex::decode(s)?)
}

macro_rules! impl_hex_fmt {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(self, f)
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0.iter() {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! impl_hex_serde {
    ($T:ident) => {
        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone, PartialOrd, Ord)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl $T {
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl FromStr for $T {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = decode_hex(s)?;
                let got = bytes.len();
                let arr: [u8; $N] = bytes
                    .try_into()
                    .map_err(|_| ParseError::Length { expected: $N, got })?;
                Ok(Self(arr))
            }
        }

        impl_hex_fmt!($T);
        impl_hex_serde!($T);
    };
}

bytesN!(Bytes32, 32);
bytesN!(Hash, 32);
bytesN!(Address, 20);

/// Channel identifier, derived from the channel parameters.
pub type ChannelId = Hash;

/// Identifier of a channel proposal, chosen by the proposing participant.
pub type ProposalId = Hash;

/// A signature as produced by a remote account.
///
/// Ethereum accounts produce 65 byte recoverable signatures, other chains may
/// use different lengths, so this is not fixed-size.
#[derive(PartialEq, Eq, Clone, Default)]
pub struct Signature(pub Vec<u8>);
impl_hex_fmt!(Signature);
impl_hex_serde!(Signature);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Vec::with_capacity(65);
        sig.extend_from_slice(rs);
        sig.push(v);
        Signature(sig)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Signature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Signature(decode_hex(s)?))
    }
}

/// Arbitrary-length bytes, hex encoded on the wire.
#[derive(PartialEq, Eq, Clone, Default)]
pub struct Bytes(pub Vec<u8>);
impl_hex_fmt!(Bytes);
impl_hex_serde!(Bytes);

impl FromStr for Bytes {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Bytes(decode_hex(s)?))
    }
}

construct_uint! {
    pub struct U256(4);
}

// Balances and chain ids travel as decimal strings, JSON numbers cannot hold
// 256 bit values.
impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_dec_str(&s).map_err(|_| de::Error::custom(ParseError::Decimal(s)))
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

impl U256 {
    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}
