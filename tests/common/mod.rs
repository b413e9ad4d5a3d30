#![allow(dead_code, unused_imports)]
//! 公共测试模块聚合：环境初始化与测速引擎的本地探测桩。

pub mod ping;
pub mod test_env;
