//! 依赖图构建和拓扑排序
//!
//! 分析 pass 之间的资源依赖关系，构建 DAG 并排序。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

use crate::resource_handle::{RgBufferHandle, RgImageHandle};

/// 依赖边：从 producer 到 consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyEdge {
    pub producer: usize,
    pub consumer: usize,
}

/// pass 之间的依赖关系
pub struct DependencyGraph {
    pass_count: usize,
    /// 出边
    adjacency: Vec<Vec<usize>>,
    in_degrees: Vec<usize>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn new(pass_count: usize) -> Self {
        Self {
            pass_count,
            adjacency: vec![Vec::new(); pass_count],
            in_degrees: vec![0; pass_count],
            edges: Vec::new(),
        }
    }

    /// producer 必须先于 consumer 执行，重复的边会被忽略
    pub fn add_edge(&mut self, producer: usize, consumer: usize) {
        if producer == consumer || self.adjacency[producer].contains(&consumer) {
            return;
        }
        self.adjacency[producer].push(consumer);
        self.in_degrees[consumer] += 1;
        self.edges.push(DependencyEdge { producer, consumer });
    }

    /// Kahn 算法
    ///
    /// 多个 pass 同时就绪时按添加顺序执行，因此没有依赖的 pass 保持声明顺序。
    ///
    /// # 返回
    /// - `Ok(order)`: 排序后的 pass 索引
    /// - `Err(cycle)`: 参与循环的 pass 索引
    pub fn topological_sort(&self) -> Result<Vec<usize>, Vec<usize>> {
        let mut in_degrees = self.in_degrees.clone();
        let mut ready = (0..self.pass_count).filter(|&i| in_degrees[i] == 0).map(Reverse).collect::<BinaryHeap<_>>();
        let mut result = Vec::with_capacity(self.pass_count);

        while let Some(Reverse(node)) = ready.pop() {
            result.push(node);
            for &next in &self.adjacency[node] {
                in_degrees[next] -= 1;
                if in_degrees[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if result.len() == self.pass_count {
            Ok(result)
        } else {
            Err((0..self.pass_count).filter(|&i| in_degrees[i] > 0).collect())
        }
    }

    pub fn predecessors(&self, pass_index: usize) -> Vec<usize> {
        self.edges.iter().filter(|e| e.consumer == pass_index).map(|e| e.producer).collect()
    }

    #[inline]
    pub fn successors(&self, pass_index: usize) -> &[usize] {
        &self.adjacency[pass_index]
    }

    #[inline]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// 从每个 pass 的读写集合构建依赖图
    ///
    /// 规则：
    /// - 写后读：reader 依赖之前最后一个 writer
    /// - 写后写：后一个 writer 依赖前一个 writer
    /// - 读后写：writer 依赖之前的所有 reader，保证读取完成
    pub fn analyze(
        pass_count: usize,
        image_reads: &[Vec<RgImageHandle>],
        image_writes: &[Vec<RgImageHandle>],
        buffer_reads: &[Vec<RgBufferHandle>],
        buffer_writes: &[Vec<RgBufferHandle>],
    ) -> Self {
        let mut graph = Self::new(pass_count);
        let mut images = AccessHistory::default();
        let mut buffers = AccessHistory::default();

        for pass in 0..pass_count {
            images.visit(&mut graph, pass, &image_reads[pass], &image_writes[pass]);
            buffers.visit(&mut graph, pass, &buffer_reads[pass], &buffer_writes[pass]);
        }
        graph
    }
}

/// 每个资源最后一次写入者以及之后的读取者
struct AccessHistory<K> {
    last_writer: HashMap<K, usize>,
    readers_since_write: HashMap<K, Vec<usize>>,
}

impl<K> Default for AccessHistory<K> {
    fn default() -> Self {
        Self {
            last_writer: HashMap::new(),
            readers_since_write: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> AccessHistory<K> {
    fn visit(&mut self, graph: &mut DependencyGraph, pass: usize, reads: &[K], writes: &[K]) {
        for &key in reads {
            if let Some(&writer) = self.last_writer.get(&key) {
                graph.add_edge(writer, pass);
            }
            self.readers_since_write.entry(key).or_default().push(pass);
        }

        for &key in writes {
            if let Some(&writer) = self.last_writer.get(&key) {
                graph.add_edge(writer, pass);
            }
            for &reader in self.readers_since_write.get(&key).into_iter().flatten() {
                graph.add_edge(reader, pass);
            }
            self.last_writer.insert(key, pass);
            self.readers_since_write.insert(key, Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn images(count: usize) -> Vec<RgImageHandle> {
        let mut map = SlotMap::<RgImageHandle, ()>::with_key();
        (0..count).map(|_| map.insert(())).collect()
    }

    fn analyze_images(reads: Vec<Vec<RgImageHandle>>, writes: Vec<Vec<RgImageHandle>>) -> DependencyGraph {
        let n = reads.len();
        DependencyGraph::analyze(n, &reads, &writes, &vec![vec![]; n], &vec![vec![]; n])
    }

    #[test]
    fn test_chain_dependency() {
        let img = images(2);
        let graph = analyze_images(vec![vec![], vec![img[0]], vec![img[1]]], vec![vec![img[0]], vec![img[1]], vec![]]);
        assert_eq!(graph.topological_sort().unwrap(), vec![0, 1, 2]);
        assert_eq!(graph.predecessors(2), vec![1]);
    }

    #[test]
    fn test_independent_passes_keep_declaration_order() {
        let img = images(2);
        let graph = analyze_images(vec![vec![], vec![], vec![img[0], img[1]]], vec![vec![img[0]], vec![img[1]], vec![]]);
        assert_eq!(graph.topological_sort().unwrap(), vec![0, 1, 2]);
        assert_eq!(graph.successors(0), &[2]);
    }

    #[test]
    fn test_write_after_read_edge() {
        let img = images(1);
        // pass 0 读取，pass 1 覆盖
        let graph = analyze_images(vec![vec![img[0]], vec![]], vec![vec![], vec![img[0]]]);
        assert_eq!(graph.edges(), &[DependencyEdge { producer: 0, consumer: 1 }]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut graph = DependencyGraph::new(3);
        graph.add_edge(0, 1);
        graph.add_edge(1, 2);
        graph.add_edge(2, 1);
        assert_eq!(graph.topological_sort(), Err(vec![1, 2]));
    }
}
