use super::{EdgeRecord, GraphFile, IoError, IoResult, TextPose, VertexRecord};
use crate::core::pose_graph::PoseGraph;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

/// Above this many lines, records are parsed in parallel.
const PARALLEL_THRESHOLD: usize = 5000;

enum ParsedRecord<M: TextPose> {
    Vertex(VertexRecord<M>),
    Edge(Box<EdgeRecord<M>>),
}

/// Memory-mapped loader for text graph files
pub struct TextGraphLoader;

impl TextGraphLoader {
    pub fn load<M: TextPose, P: AsRef<Path>>(path: P) -> IoResult<GraphFile<M>> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let content = std::str::from_utf8(&mmap).map_err(|e| IoError::Parse {
            line: 0,
            message: format!("Invalid UTF-8: {e}"),
        })?;

        Self::parse_content(content)
    }

    /// Dimension of the poses in a file, taken from the first vertex or edge tag.
    pub fn detect_dimension<P: AsRef<Path>>(path: P) -> IoResult<usize> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let content = String::from_utf8_lossy(&mmap);
        for line in content.lines() {
            match line.split_whitespace().next() {
                Some("VERTEX" | "VERTEX2" | "EDGE" | "EDGE2") => return Ok(2),
                Some("VERTEX3" | "EDGE3") => return Ok(3),
                _ => {}
            }
        }
        Err(IoError::UnsupportedFormat(
            "no VERTEX2/EDGE2/VERTEX3/EDGE3 records found".to_string(),
        ))
    }

    pub fn parse_content<M: TextPose>(content: &str) -> IoResult<GraphFile<M>> {
        let lines: Vec<&str> = content.lines().collect();

        let records: Vec<Option<ParsedRecord<M>>> = if lines.len() > PARALLEL_THRESHOLD {
            lines
                .par_iter()
                .enumerate()
                .map(|(line_num, line)| Self::parse_line(line, line_num + 1))
                .collect::<IoResult<_>>()?
        } else {
            lines
                .iter()
                .enumerate()
                .map(|(line_num, line)| Self::parse_line(line, line_num + 1))
                .collect::<IoResult<_>>()?
        };

        let mut graph = GraphFile::new();
        for record in records.into_iter().flatten() {
            match record {
                ParsedRecord::Vertex(vertex) => {
                    let id = vertex.id;
                    if !graph.push_vertex(vertex) {
                        warn!(id, "vertex is already in the graph, reassigning");
                    }
                }
                ParsedRecord::Edge(edge) => {
                    if let Some(missing) = [edge.from, edge.to]
                        .into_iter()
                        .find(|&id| !graph.contains_vertex(id))
                    {
                        warn!(
                            from = edge.from,
                            to = edge.to,
                            missing,
                            "edge refers to an unknown vertex, skipping"
                        );
                        continue;
                    }
                    if edge.from == edge.to {
                        warn!(id = edge.from, "self-loop edge, skipping");
                        continue;
                    }
                    graph.push_edge(*edge);
                }
            }
        }

        debug!(
            vertices = graph.vertex_count(),
            edges = graph.edge_count(),
            "graph file parsed"
        );
        Ok(graph)
    }

    fn parse_line<M: TextPose>(line: &str, line_num: usize) -> IoResult<Option<ParsedRecord<M>>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&tag) = parts.first() else {
            return Ok(None);
        };

        if M::VERTEX_TAGS.contains(&tag) {
            if parts.len() < 2 + M::POSE_FIELDS {
                return Err(IoError::MissingFields { line: line_num });
            }
            let id = parse_field(parts[1], line_num)?;
            let fields = parse_fields(&parts[2..2 + M::POSE_FIELDS], line_num)?;
            Ok(Some(ParsedRecord::Vertex(VertexRecord {
                id,
                pose: M::from_fields(&fields),
            })))
        } else if M::EDGE_TAGS.contains(&tag) {
            let info_start = 3 + M::POSE_FIELDS;
            let info_end = info_start + M::information_fields();
            if parts.len() < info_end {
                return Err(IoError::MissingFields { line: line_num });
            }
            let from = parse_field(parts[1], line_num)?;
            let to = parse_field(parts[2], line_num)?;
            let mean = parse_fields(&parts[3..info_start], line_num)?;
            let information = parse_fields(&parts[info_start..info_end], line_num)?;
            Ok(Some(ParsedRecord::Edge(Box::new(EdgeRecord {
                from,
                to,
                mean: M::from_fields(&mean),
                information: M::information_from_fields(&information),
            }))))
        } else {
            // Skip unknown types silently for compatibility
            Ok(None)
        }
    }
}

fn parse_field<T: FromStr>(value: &str, line: usize) -> IoResult<T> {
    value.parse::<T>().map_err(|_| IoError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}

fn parse_fields(values: &[&str], line: usize) -> IoResult<Vec<f64>> {
    values.iter().map(|v| parse_field(v, line)).collect()
}

/// Writer for text graph files
pub struct TextGraphWriter;

impl TextGraphWriter {
    pub fn write<M: TextPose, P: AsRef<Path>>(
        graph: &PoseGraph<M>,
        path: P,
        only_marked: bool,
    ) -> IoResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(graph, &mut writer, only_marked)?;
        writer.flush()?;
        Ok(())
    }

    /// Vertices first, then sequential edges (ids one apart), then loop edges. Every edge
    /// is stated from its lower id. With `only_marked`, unmarked edges are left out.
    pub fn write_to<M: TextPose, W: Write>(
        graph: &PoseGraph<M>,
        writer: &mut W,
        only_marked: bool,
    ) -> IoResult<()> {
        for vertex in graph.vertices() {
            write!(writer, "{} {}", M::VERTEX_TAGS[0], vertex.id())?;
            write_values(writer, &vertex.data.pose.to_fields())?;
            writeln!(writer)?;
        }

        for loops in [false, true] {
            writeln!(
                writer,
                "{}",
                if loops { "#LOOP EDGES" } else { "#SEQUENTIAL EDGES" }
            )?;
            for edge in graph.edges() {
                if only_marked && !edge.mark {
                    continue;
                }
                if (edge.from().abs_diff(edge.to()) != 1) != loops {
                    continue;
                }
                let forward = edge.from() < edge.to();
                let (from, to) = if forward {
                    (edge.from(), edge.to())
                } else {
                    (edge.to(), edge.from())
                };
                write!(writer, "{} {} {}", M::EDGE_TAGS[0], from, to)?;
                write_values(writer, &edge.data.mean_in_direction(forward).to_fields())?;
                write_values(writer, &M::information_to_fields(edge.data.information()))?;
                writeln!(writer)?;
            }
        }
        Ok(())
    }
}

fn write_values<W: Write>(writer: &mut W, values: &[f64]) -> std::io::Result<()> {
    for value in values {
        write!(writer, " {value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{PoseManifold, SE2, SE3};
    use nalgebra::DMatrix;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_simple_graph() -> Result<(), IoError> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, "VERTEX2 0 0.0 0.0 0.0")?;
        writeln!(temp_file, "VERTEX 1 1.0 0.0 0.0")?;
        writeln!(temp_file, "# This is a comment")?;
        writeln!(temp_file)?;
        writeln!(temp_file, "ROBOTLASER1 whatever")?;
        writeln!(temp_file, "EDGE2 0 1 1.0 0.0 0.0 1 0 1 1 0 0")?;

        let graph = TextGraphLoader::load::<SE2, _>(temp_file.path())?;
        assert_eq!(graph.vertex_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges[0].information, DMatrix::identity(3, 3));
        Ok(())
    }

    #[test]
    fn test_missing_fields_reports_line() -> Result<(), std::io::Error> {
        let mut temp_file = NamedTempFile::new()?;
        writeln!(temp_file, "VERTEX2 0 0.0 0.0 0.0")?;
        writeln!(temp_file, "VERTEX2 1 1.0")?;

        let result = TextGraphLoader::load::<SE2, _>(temp_file.path());
        assert!(matches!(result, Err(IoError::MissingFields { line: 2 })));
        Ok(())
    }

    #[test]
    fn test_invalid_number_reports_value() {
        let result = TextGraphLoader::parse_content::<SE2>("VERTEX2 0 zero 0.0 0.0\n");
        match result {
            Err(IoError::InvalidNumber { line, value }) => {
                assert_eq!(line, 1);
                assert_eq!(value, "zero");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_edges_to_unknown_vertices_are_skipped() {
        let content = "VERTEX2 0 0 0 0\nEDGE2 0 7 1 0 0 1 0 1 1 0 0\nEDGE2 0 0 1 0 0 1 0 1 1 0 0\n";
        let graph = TextGraphLoader::parse_content::<SE2>(content).unwrap();
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_other_dimension_is_ignored() {
        let content = "VERTEX3 0 0 0 0 0 0 0\nVERTEX2 1 0 0 0\n";
        let graph = TextGraphLoader::parse_content::<SE2>(content).unwrap();
        assert_eq!(graph.vertex_count(), 1);
        assert_eq!(graph.vertices[0].id, 1);
    }

    #[test]
    fn test_parallel_parse_matches_sequential_order() {
        let mut content = String::new();
        for id in 0..3000 {
            content.push_str(&format!("VERTEX2 {id} {id}.0 0.0 0.0\n"));
        }
        for id in 1..3000 {
            content.push_str(&format!("EDGE2 {} {id} 1.0 0.0 0.0 1 0 1 1 0 0\n", id - 1));
        }
        let graph = TextGraphLoader::parse_content::<SE2>(&content).unwrap();
        assert_eq!(graph.vertex_count(), 3000);
        assert_eq!(graph.edge_count(), 2999);
        assert!(graph.vertices.iter().enumerate().all(|(k, v)| v.id == k));
        assert_eq!((graph.edges[10].from, graph.edges[10].to), (10, 11));
    }

    #[test]
    fn test_detect_dimension() -> Result<(), IoError> {
        let mut planar = NamedTempFile::new()?;
        writeln!(planar, "# header")?;
        writeln!(planar, "VERTEX2 0 0 0 0")?;
        assert_eq!(TextGraphLoader::detect_dimension(planar.path())?, 2);

        let mut spatial = NamedTempFile::new()?;
        writeln!(spatial, "VERTEX3 0 0 0 0 0 0 0")?;
        assert_eq!(TextGraphLoader::detect_dimension(spatial.path())?, 3);

        let empty = NamedTempFile::new()?;
        assert!(matches!(
            TextGraphLoader::detect_dimension(empty.path()),
            Err(IoError::UnsupportedFormat(_))
        ));
        Ok(())
    }

    #[test]
    fn test_writer_orders_and_reverts_edges() {
        let mut graph = PoseGraph::<SE2>::new();
        let info = DMatrix::identity(3, 3);
        for id in 0..3 {
            graph.add_pose_vertex(id, SE2::identity(), &info).unwrap();
        }
        graph
            .add_pose_edge(2, 0, SE2::from_xy_angle(1.0, 0.0, 0.0), info.clone())
            .unwrap();
        graph
            .add_pose_edge(1, 0, SE2::from_xy_angle(1.0, 0.0, 0.0), info.clone())
            .unwrap();

        let mut buffer = Vec::new();
        TextGraphWriter::write_to(&graph, &mut buffer, false).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "VERTEX2 0 0 0 0");
        assert_eq!(lines[3], "#SEQUENTIAL EDGES");
        assert!(lines[4].starts_with("EDGE2 0 1 "));
        assert_eq!(lines[5], "#LOOP EDGES");
        assert!(lines[6].starts_with("EDGE2 0 2 "));

        let values: Vec<f64> = lines[6]
            .split_whitespace()
            .skip(3)
            .map(|v| v.parse().unwrap())
            .collect();
        let expected = [-1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0];
        assert_eq!(values.len(), expected.len());
        for (a, b) in values.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_writer_respects_marks() {
        let mut graph = PoseGraph::<SE3>::new();
        let info = DMatrix::identity(6, 6);
        for id in 0..3 {
            graph.add_pose_vertex(id, SE3::identity(), &info).unwrap();
        }
        let first = graph.add_pose_edge(0, 1, SE3::identity(), info.clone()).unwrap();
        graph.add_pose_edge(1, 2, SE3::identity(), info.clone()).unwrap();
        graph.edge_mut(first).unwrap().mark = true;

        let mut buffer = Vec::new();
        TextGraphWriter::write_to(&graph, &mut buffer, true).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("EDGE3")).count(), 1);
        assert!(text.contains("EDGE3 0 1 "));
        assert_eq!(text.lines().filter(|l| l.starts_with("VERTEX3")).count(), 3);
    }
}
