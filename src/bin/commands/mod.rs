pub mod build_patch_cmd;
pub mod dump_cmd;
pub mod geonames_cmd;
pub mod inspect_cmd;
pub mod lookup_cmd;
pub mod update_cmd;
pub mod watch_cmd;

pub use build_patch_cmd::cmd_build_patch;
pub use dump_cmd::{cmd_dump_csv, cmd_dump_mmdb};
pub use geonames_cmd::cmd_geonames;
pub use inspect_cmd::cmd_inspect;
pub use lookup_cmd::cmd_lookup;
pub use update_cmd::{cmd_check_updates, cmd_update};
pub use watch_cmd::cmd_watch;
