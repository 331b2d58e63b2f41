//! Arguments owned by the host tool. Token modules may reference these by
//! name; everything else they declare must live under `plugin-<type>-`.

use cryptplug_core::CoreArg;

pub static CORE_ARGS: &[CoreArg] = &[
    CoreArg::flag("verbose", "Shows more detailed error messages").with_short('v'),
    CoreArg::flag("debug", "Show debug messages"),
    CoreArg::flag("batch-mode", "Do not ask for confirmation").with_short('q'),
    CoreArg::value("key-slot", "Slot number for new key (default is first free)").with_short('S'),
    CoreArg::value("token-id", "Token number (default: any)"),
    CoreArg::flag("token-only", "Do not ask for passphrase if activation by token fails"),
    CoreArg::value("header", "Device or file with separated LUKS header"),
    CoreArg::value("timeout", "Timeout for interactive passphrase prompt (in seconds)").with_short('t'),
    CoreArg::value("json-file", "Read or write the json from or to a file"),
];
