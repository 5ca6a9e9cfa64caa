//! Declarative helpers for the error-code table and the model catalog.

/// Declares numeric error codes together with their message table.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Returns the human-readable message for an error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}

/// Declares the supported device models and their miIO model identifiers.
macro_rules! define_models {
    ($($(#[$meta:meta])* $variant:ident = $id:literal),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Model {
            $($(#[$meta])* $variant,)*
        }

        impl Model {
            /// Every known model, in declaration order.
            pub const ALL: &'static [Model] = &[$(Model::$variant,)*];

            /// The miIO model identifier (e.g. `xjx.toilet.pro`).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Model::$variant => $id,)*
                }
            }
        }

        impl std::str::FromStr for Model {
            type Err = $crate::error::MiioError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($id => Ok(Model::$variant),)*
                    _ => Err($crate::error::MiioError::Config(format!(
                        "unsupported model '{}'",
                        s
                    ))),
                }
            }
        }

        impl std::fmt::Display for Model {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
