// 音频处理模块
//
// 子模块：
// - separator: 分离引擎接口（audio-separator 命令行实现）
// - voice: 变声引擎接口（外部推理进程实现）
// - ffmpeg: 转码接口（ffmpeg 实现）
// - normalize: 第一阶段前的输入格式规范化
// - process: 外部进程执行与超时

pub mod ffmpeg;
pub mod normalize;
pub mod process;
pub mod separator;
pub mod voice;
