#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub path: String,
    pub kind: NodeEventKind,
    pub version: i32,
}

impl NodeEvent {
    pub fn new(node: &Node, kind: NodeEventKind) -> Self {
        Self {
            path: node.path.clone(),
            kind,
            version: node.version,
        }
    }
}
