//! 执行协作件：沙箱文件系统与受限 Shell

pub mod fs;
pub mod shell;

pub use fs::SafeFs;
pub use shell::{ShellOutput, ShellRunner};
