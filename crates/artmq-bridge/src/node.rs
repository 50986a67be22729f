//! Lighting network nodes as seen by the bridge

use artmq_core::LightingAddress;

/// One DMX port on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    /// Universe the port is patched to
    pub address: LightingAddress,
    /// Port index on the node (0..4)
    pub index: u8,
}

impl Port {
    pub fn new(index: u8, address: LightingAddress) -> Self {
        Self { address, index }
    }
}

/// A device visible on the lighting network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Stable identifier (IP address, plus bind index for multi-page nodes)
    pub id: String,
    /// Short name reported by the node
    pub name: String,
    /// Long name / description reported by the node
    pub long_name: String,
    /// Ports receiving DMX from the network
    pub outputs: Vec<Port>,
    /// Ports sending DMX onto the network
    pub inputs: Vec<Port>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            long_name: String::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, address: LightingAddress) -> Self {
        let index = self.outputs.len() as u8;
        self.outputs.push(Port::new(index, address));
        self
    }

    pub fn with_input(mut self, address: LightingAddress) -> Self {
        let index = self.inputs.len() as u8;
        self.inputs.push(Port::new(index, address));
        self
    }

    /// Does any output port listen on `address`?
    pub fn outputs_to(&self, address: LightingAddress) -> bool {
        self.outputs.iter().any(|p| p.address == address)
    }

    /// One-line description for the periodic device log
    pub fn describe(&self) -> String {
        let join = |ports: &[Port]| {
            ports
                .iter()
                .map(|p| p.address.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        };

        format!(
            "IP={} name={:?} desc={:?} inputs={:?} outputs={:?}",
            self.id,
            self.name,
            self.long_name,
            join(&self.inputs),
            join(&self.outputs)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let node = Node::new("192.168.6.10", "dimmer")
            .with_output(LightingAddress::new(0, 3))
            .with_output(LightingAddress::new(0, 4))
            .with_input(LightingAddress::new(1, 0));

        let text = node.describe();
        assert!(text.starts_with("IP=192.168.6.10 name=\"dimmer\""));
        assert!(text.contains("outputs=\"0:0.3; 0:0.4\""));
        assert!(text.contains("inputs=\"1:0.0\""));
        assert!(node.outputs_to(LightingAddress::new(0, 4)));
        assert!(!node.outputs_to(LightingAddress::new(1, 0)));
    }
}
