//! Declarative helpers shared across the crate.

/// Defines the `CommandCode` enum together with its `u16` conversions.
///
/// Every listed variant becomes part of the known code table; anything else
/// decoded from the wire is reported as unhandled instead of failing.
macro_rules! define_command_code {
    ($($name:ident = $val:expr),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        #[allow(non_camel_case_types)]
        pub enum CommandCode {
            $($name = $val),*
        }

        impl CommandCode {
            pub fn from_u16(val: u16) -> Option<Self> {
                match val {
                    $($val => Some(CommandCode::$name),)*
                    _ => None,
                }
            }

            pub fn as_u16(self) -> u16 {
                self as u16
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(CommandCode::$name => stringify!($name),)*
                }
            }
        }

        impl std::fmt::Display for CommandCode {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}(0x{:04X})", self.name(), self.as_u16())
            }
        }

        impl TryFrom<u16> for CommandCode {
            type Error = u16;

            fn try_from(val: u16) -> std::result::Result<Self, Self::Error> {
                Self::from_u16(val).ok_or(val)
            }
        }
    };
}
