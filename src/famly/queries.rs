/// Observations feed query. Videos are a union; only transcoded ones carry a
/// playable URL, other members come back as empty objects.
pub(crate) const OBSERVATIONS_QUERY: &str = r#"
query GetObservations($childIds: [ChildId!], $first: Int!, $after: ObservationCursor) {
  childDevelopment {
    observations(childIds: $childIds, first: $first, after: $after) {
      results {
        id
        remark {
          id
          date
          body
        }
        images {
          id
          width
          height
          url
          secret {
            prefix
            key
            path
            expires
          }
        }
        files {
          id
          name
          url
        }
        videos {
          ... on TranscodedVideo {
            id
            videoUrl
            thumbnailUrl
            duration
            width
            height
          }
        }
      }
      next
    }
  }
}"#;

pub(crate) const OBSERVATIONS_OPERATION: &str = "GetObservations";

/// Build the GraphQL request body for one observations page.
pub(crate) fn observations_request(
    child_ids: &[String],
    first: u32,
    after: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "operationName": OBSERVATIONS_OPERATION,
        "query": OBSERVATIONS_QUERY,
        "variables": {
            "childIds": child_ids,
            "first": first,
            "after": after,
        },
    })
}
