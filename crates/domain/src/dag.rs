//! 工作流依赖图校验
//!
//! 图中任何时刻都不允许存在环：加边前先做前瞻检查，
//! 拒绝时已存储的图保持原样。校验复杂度 O(V+E)。

use std::collections::{HashMap, HashSet, VecDeque};

use jobflow_core::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    nodes: HashSet<i64>,
    /// parent -> children
    children: HashMap<i64, Vec<i64>>,
    /// child -> parents
    parents: HashMap<i64, Vec<i64>>,
    edge_set: HashSet<(i64, i64)>,
}

impl DagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: i64) {
        self.nodes.insert(node);
    }

    pub fn contains_node(&self, node: i64) -> bool {
        self.nodes.contains(&node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_set.len()
    }

    /// 尝试添加 parent -> child 依赖边
    ///
    /// 自环、重复边、未知端点、以及任何会引入环的边都被拒绝，
    /// 拒绝时不产生任何副作用。
    pub fn try_add_edge(&mut self, parent: i64, child: i64) -> SchedulerResult<()> {
        if parent == child {
            return Err(SchedulerError::CycleDetected {
                nodes: vec![parent],
            });
        }
        if !self.nodes.contains(&parent) {
            return Err(SchedulerError::validation(format!(
                "依赖边的端点不存在: {parent}"
            )));
        }
        if !self.nodes.contains(&child) {
            return Err(SchedulerError::validation(format!(
                "依赖边的端点不存在: {child}"
            )));
        }
        if self.edge_set.contains(&(parent, child)) {
            return Err(SchedulerError::validation(format!(
                "依赖边已存在: {parent} -> {child}"
            )));
        }
        // 前瞻检查：child能到达parent则这条边会闭环
        if let Some(mut path) = self.find_path(child, parent) {
            path.push(child);
            return Err(SchedulerError::CycleDetected { nodes: path });
        }

        self.edge_set.insert((parent, child));
        self.children.entry(parent).or_default().push(child);
        self.parents.entry(child).or_default().push(parent);
        Ok(())
    }

    /// DFS找一条from到to的路径，存在则返回路径节点
    fn find_path(&self, from: i64, to: i64) -> Option<Vec<i64>> {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        let mut came_from: HashMap<i64, i64> = HashMap::new();
        while let Some(node) = stack.pop() {
            if node == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = came_from.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = self.children.get(&node) {
                for &n in next {
                    if !visited.contains(&n) {
                        came_from.entry(n).or_insert(node);
                        stack.push(n);
                    }
                }
            }
        }
        None
    }

    pub fn successors(&self, node: i64) -> &[i64] {
        self.children.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, node: i64) -> &[i64] {
        self.parents.get(&node).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// 传递闭包意义上的全部下游节点
    pub fn descendants(&self, node: i64) -> Vec<i64> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<i64> = self.successors(node).to_vec();
        while let Some(n) = stack.pop() {
            if !visited.insert(n) {
                continue;
            }
            result.push(n);
            stack.extend_from_slice(self.successors(n));
        }
        result
    }

    /// 三色DFS校验无环，成环时报告环上的节点
    ///
    /// 白=未访问，灰=在当前DFS栈上，黑=已完成。
    /// 遇到灰节点即说明成环，环成员从当前栈上截取。
    pub fn validate(&self) -> SchedulerResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<i64, Color> =
            self.nodes.iter().map(|&n| (n, Color::White)).collect();

        for &start in &self.nodes {
            if color[&start] != Color::White {
                continue;
            }
            // 显式栈：(节点, 下一个待访问的子节点下标)
            let mut stack: Vec<(i64, usize)> = vec![(start, 0)];
            color.insert(start, Color::Gray);
            while let Some(&mut (node, ref mut idx)) = stack.last_mut() {
                let next = self.successors(node).get(*idx).copied();
                *idx += 1;
                match next {
                    Some(child) => match color[&child] {
                        Color::White => {
                            color.insert(child, Color::Gray);
                            stack.push((child, 0));
                        }
                        Color::Gray => {
                            let cycle_start = stack
                                .iter()
                                .position(|&(n, _)| n == child)
                                .unwrap_or(0);
                            let nodes: Vec<i64> =
                                stack[cycle_start..].iter().map(|&(n, _)| n).collect();
                            return Err(SchedulerError::CycleDetected { nodes });
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(node, Color::Black);
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Kahn算法拓扑排序，成环时报告未能排序的节点
    pub fn topological_sort(&self) -> SchedulerResult<Vec<i64>> {
        let mut in_degree: HashMap<i64, usize> =
            self.nodes.iter().map(|&n| (n, 0)).collect();
        for &(_, child) in &self.edge_set {
            *in_degree.entry(child).or_insert(0) += 1;
        }

        let mut queue: VecDeque<i64> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for &child in self.successors(node) {
                let degree = in_degree.get_mut(&child).ok_or_else(|| {
                    SchedulerError::Internal(format!("入度表缺少节点: {child}"))
                })?;
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let sorted_set: HashSet<i64> = sorted.iter().copied().collect();
            let nodes: Vec<i64> = self
                .nodes
                .iter()
                .filter(|n| !sorted_set.contains(n))
                .copied()
                .collect();
            return Err(SchedulerError::CycleDetected { nodes });
        }
        Ok(sorted)
    }

    /// 所有前置都在done集合中、自身不在done中的节点
    pub fn ready_nodes(&self, done: &HashSet<i64>) -> Vec<i64> {
        self.nodes
            .iter()
            .filter(|&&n| !done.contains(&n))
            .filter(|&&n| self.predecessors(n).iter().all(|p| done.contains(p)))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_nodes(nodes: &[i64]) -> DagGraph {
        let mut graph = DagGraph::new();
        for &n in nodes {
            graph.add_node(n);
        }
        graph
    }

    #[test]
    fn acyclic_edges_accepted() {
        let mut graph = graph_with_nodes(&[1, 2, 3]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(2, 3).unwrap();
        graph.try_add_edge(1, 3).unwrap();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn self_loop_rejected() {
        let mut graph = graph_with_nodes(&[1]);
        let err = graph.try_add_edge(1, 1).unwrap_err();
        assert!(matches!(err, SchedulerError::CycleDetected { .. }));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn cycle_closing_edge_rejected_without_mutation() {
        let mut graph = graph_with_nodes(&[1, 2, 3]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(2, 3).unwrap();
        let err = graph.try_add_edge(3, 1).unwrap_err();
        match err {
            SchedulerError::CycleDetected { nodes } => {
                assert!(nodes.contains(&1));
                assert!(nodes.contains(&3));
            }
            other => panic!("预期环检测错误，实际: {other}"),
        }
        // 被拒绝的边不留痕迹
        assert_eq!(graph.edge_count(), 2);
        assert!(graph.validate().is_ok());
        assert_eq!(graph.successors(3), &[] as &[i64]);
    }

    #[test]
    fn duplicate_edge_rejected() {
        let mut graph = graph_with_nodes(&[1, 2]);
        graph.try_add_edge(1, 2).unwrap();
        let err = graph.try_add_edge(1, 2).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn unknown_endpoint_rejected() {
        let mut graph = graph_with_nodes(&[1]);
        let err = graph.try_add_edge(1, 99).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn topological_sort_respects_edges() {
        let mut graph = graph_with_nodes(&[1, 2, 3, 4]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(1, 3).unwrap();
        graph.try_add_edge(2, 4).unwrap();
        graph.try_add_edge(3, 4).unwrap();
        let sorted = graph.topological_sort().unwrap();
        let pos = |n: i64| sorted.iter().position(|&x| x == n).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(4));
        assert!(pos(3) < pos(4));
    }

    #[test]
    fn validate_reports_cycle_members() {
        // 绕过try_add_edge构造一个坏图，validate必须兜底发现
        let mut graph = graph_with_nodes(&[1, 2, 3, 4]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(2, 3).unwrap();
        graph.edge_set.insert((3, 2));
        graph.children.entry(3).or_default().push(2);
        graph.parents.entry(2).or_default().push(3);
        match graph.validate().unwrap_err() {
            SchedulerError::CycleDetected { nodes } => {
                assert!(nodes.contains(&2));
                assert!(nodes.contains(&3));
                assert!(!nodes.contains(&4));
            }
            other => panic!("预期环检测错误，实际: {other}"),
        }
    }

    #[test]
    fn ready_nodes_follow_completion() {
        let mut graph = graph_with_nodes(&[1, 2, 3]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(2, 3).unwrap();
        let mut done = HashSet::new();
        assert_eq!(graph.ready_nodes(&done), vec![1]);
        done.insert(1);
        assert_eq!(graph.ready_nodes(&done), vec![2]);
        done.insert(2);
        assert_eq!(graph.ready_nodes(&done), vec![3]);
    }

    #[test]
    fn descendants_are_transitive() {
        let mut graph = graph_with_nodes(&[1, 2, 3, 4, 5]);
        graph.try_add_edge(1, 2).unwrap();
        graph.try_add_edge(2, 3).unwrap();
        graph.try_add_edge(2, 4).unwrap();
        let mut downstream = graph.descendants(1);
        downstream.sort_unstable();
        assert_eq!(downstream, vec![2, 3, 4]);
        assert!(graph.descendants(5).is_empty());
    }
}
