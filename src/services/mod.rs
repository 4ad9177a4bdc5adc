//! 服务层
//!
//! 调和与生命周期引擎：凭证版本管理、服务调和、安装管道、
//! runlevel 控制器、看门狗、在线上报、应用管理和总线边界。

pub mod apps;
pub mod bus;
pub mod certificates;
pub mod credentials;
pub mod install;
pub mod presence;
pub mod reconciler;
pub mod runlevel;
pub mod supervisor;
pub mod watchdog;
