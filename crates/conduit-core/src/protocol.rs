//! # 协议能力集与协商
//!
//! ## 核心意图（Why）
//! - 每个节点支持一小组线协议；建立连接时远端通告自己的能力集，本地据此选出本次操作
//!   使用的协议；
//! - 协商结果必须确定：与任一能力集的枚举顺序无关，只取决于两集合的交集。
//!
//! ## 行为契约（What）
//! - [`Protocol::BY_PRIORITY`] 给出全序优先级，`OpCommandV1` 高于 `OpQuery`；
//! - [`negotiate`] 返回交集中优先级最高的协议；交集为空返回 `None`，调用方必须失败而不是降级。
//!
//! ## 风险提示（Trade-offs）
//! - 能力集用 `u8` 位图表示，线上探测报文只需一个字节；未知位在 [`ProtocolSet::from_bits`] 中被丢弃。

use std::fmt;

use serde::Deserialize;

/// 线协议。
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// 旧式查询报文承载命令。
    OpQuery,
    /// 专用命令报文。
    OpCommandV1,
}

impl Protocol {
    /// 优先级由高到低。
    pub const BY_PRIORITY: [Protocol; 2] = [Protocol::OpCommandV1, Protocol::OpQuery];

    /// 在能力位图中占用的位。
    pub const fn bit(self) -> u8 {
        match self {
            Protocol::OpQuery => 0b0000_0001,
            Protocol::OpCommandV1 => 0b0000_0010,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Protocol::OpQuery => "op_query",
            Protocol::OpCommandV1 => "op_command_v1",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 协议能力集。
///
/// # 教案式说明
/// - **意图 (Why)**：本地支持集与远端通告集都用同一类型表达，交集运算即位与；
/// - **契约 (What)**：只包含 [`Protocol`] 已定义的位；`Copy` 语义，可随连接自由复制；
/// - **风险 (Trade-offs)**：新增协议需要同时扩展 `bit`、`BY_PRIORITY` 与 [`ProtocolSet::ALL`]。
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct ProtocolSet(u8);

impl ProtocolSet {
    pub const EMPTY: ProtocolSet = ProtocolSet(0);
    pub const ALL: ProtocolSet =
        ProtocolSet(Protocol::OpQuery.bit() | Protocol::OpCommandV1.bit());

    pub const fn empty() -> Self {
        Self::EMPTY
    }

    pub const fn all() -> Self {
        Self::ALL
    }

    /// 从线上位图构造，未知位被丢弃。
    pub const fn from_bits(bits: u8) -> Self {
        ProtocolSet(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, protocol: Protocol) -> bool {
        self.0 & protocol.bit() != 0
    }

    pub fn insert(&mut self, protocol: Protocol) {
        self.0 |= protocol.bit();
    }

    pub const fn intersection(self, other: ProtocolSet) -> ProtocolSet {
        ProtocolSet(self.0 & other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 按优先级由高到低遍历集合成员。
    pub fn iter(self) -> impl Iterator<Item = Protocol> {
        Protocol::BY_PRIORITY
            .into_iter()
            .filter(move |protocol| self.contains(*protocol))
    }
}

impl FromIterator<Protocol> for ProtocolSet {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        let mut set = ProtocolSet::EMPTY;
        for protocol in iter {
            set.insert(protocol);
        }
        set
    }
}

impl fmt::Debug for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ProtocolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, protocol) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(protocol.name())?;
        }
        f.write_str("]")
    }
}

/// 选出本地与远端共同支持的最高优先级协议。
///
/// # 教案式注释
/// - **意图 (Why)**：连接验证阶段据此固定本次操作的线协议；
/// - **契约 (What)**：交集非空时结果唯一且与集合构造顺序无关；交集为空返回 `None`；
/// - **执行 (How)**：沿 [`Protocol::BY_PRIORITY`] 找到第一个同时落在两集合中的协议。
pub fn negotiate(local: ProtocolSet, remote: ProtocolSet) -> Option<Protocol> {
    local.intersection(remote).iter().next()
}
